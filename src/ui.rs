// src/ui.rs

use crate::{
    constants,
    error::{AppError, AppResult},
    symbols, utils,
};
use anyhow::anyhow;
use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use qrcode::{EcLevel, QrCode, render::unicode};
use std::io::{self, Write};

const PROGRESS_TEMPLATE: &str =
    "{prefix:.bold.cyan} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {wide_msg}";
const PROGRESS_PREFIX_WIDTH: usize = 36;

/// 方框的一条横线，`left`/`right` 为两端的拐角字符
fn border(left: char, right: char) {
    println!("{}{}{}", left, "─".repeat(constants::UI_WIDTH - 2), right);
}

fn boxed(title: ColoredString, body: impl FnOnce()) {
    println!();
    border('┌', '┐');
    println!("  {}", title);
    border('├', '┤');
    body();
    border('└', '┘');
}

pub fn print_header(title: &str) {
    let rule = "═".repeat(constants::UI_WIDTH);
    println!("\n{}\n {}\n{}", rule, title.cyan().bold(), rule);
}

pub fn print_sub_header(title: &str) {
    println!("\n--- {} ---", title.bold());
}

pub fn box_message(title: &str, content: &[&str], color_func: fn(ColoredString) -> ColoredString) {
    boxed(color_func(title.bold()), || {
        content.iter().for_each(|line| println!("  {}", line));
    });
}

pub fn plain(message: &str) {
    println!("{}", message);
}

pub fn info(message: &str) {
    println!("{} {}", *symbols::INFO, message);
}

pub fn ok(message: &str) {
    println!("{} {}", *symbols::OK, message);
}

pub fn warn(message: &str) {
    println!("{} {}", *symbols::WARN, message.yellow());
}

pub fn error(message: &str) {
    eprintln!("{} {}", *symbols::ERROR, message.red());
}

/// 把登录链接渲染成终端可扫的二维码，每个字符对应上下两个模块。
/// 按深色背景的终端反色输出。
pub fn render_qr(data: &str) -> AppResult<String> {
    let code = QrCode::with_error_correction_level(data, EcLevel::M)
        .map_err(|e| AppError::Other(anyhow!("生成二维码失败: {}", e)))?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// 读取一行输入。标准输入关闭时返回 `UnexpectedEof`，避免交互循环空转。
pub fn prompt(message: &str, default: Option<&str>) -> io::Result<String> {
    match default {
        Some(d) => print!("\n>>> {} (默认: {}): ", message, d),
        None => print!("\n>>> {}: ", message),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    if io::stdin().read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "输入已结束"));
    }
    match line.trim() {
        "" => Ok(default.unwrap_or_default().to_string()),
        input => Ok(input.to_string()),
    }
}

/// 是/否确认。输入结束视为否。
pub fn confirm(question: &str, default_yes: bool) -> bool {
    let hint = if default_yes { "(Y/n)" } else { "(y/N)" };
    let message = format!("{} {} (按 {} 取消)", question, hint, *symbols::CTRL_C);
    loop {
        let Ok(answer) = prompt(&message, None) else {
            return false;
        };
        match answer.to_lowercase().as_str() {
            "" => return default_yes,
            "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => println!("{}", "无效输入，请输入 'y' 或 'n'。".red()),
        }
    }
}

pub fn selection_menu(
    options: &[String],
    title: &str,
    instructions: &str,
    default_choice: &str,
) -> String {
    let width = options.len().to_string().len();
    println!();
    border('┌', '┐');
    println!("  {}", title.cyan().bold());
    border('├', '┤');
    for (i, option) in options.iter().enumerate() {
        let number = format!("{:<width$}", i + 1, width = width);
        println!("  [{}] {}", number.yellow(), option);
    }
    border('├', '┤');
    println!("  {} (按 {} 可取消)", instructions, *symbols::CTRL_C);
    border('└', '┘');

    prompt("请输入你的选择", Some(default_choice)).unwrap_or_default()
}

/// 读取不回显的输入，用于粘贴 Cookie
pub fn prompt_hidden(message: &str) -> io::Result<String> {
    print!("\n>>> {}: ", message);
    io::stdout().flush()?;
    rpassword::read_password()
}

/// 多选菜单，返回被选中项的下标
pub fn get_user_choices_from_menu(
    options: &[String],
    title: &str,
    default_choice: &str,
) -> Vec<usize> {
    if options.is_empty() {
        return vec![];
    }
    let input = selection_menu(options, title, "支持格式: 1, 3, 2-4, all", default_choice);
    utils::parse_selection_indices(&input, options.len())
}

/// 单个任务的字节进度条
pub fn new_task_progress_bar(multi: &MultiProgress, total: u64, name: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let bar = multi.add(ProgressBar::new(total).with_style(style));
    bar.set_prefix(utils::truncate_text(name, PROGRESS_PREFIX_WIDTH));
    bar
}
