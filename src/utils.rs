// src/utils.rs

use crate::constants;
use regex::Regex;
use std::{
    collections::BTreeSet,
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::LazyLock,
};

static ILLEGAL_CHARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|\x00-\x1f]"#).unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// 去掉常见文件系统不允许的字符，并限制文件名的字节长度。
pub fn sanitize_filename(name: &str) -> String {
    let original_name = name.trim();
    if original_name.is_empty() {
        return "unknown".to_string();
    }

    let stem = Path::new(original_name)
        .file_stem()
        .unwrap_or_else(|| OsStr::new(original_name))
        .to_string_lossy()
        .to_uppercase();
    let windows_reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    let mut name = if windows_reserved.contains(&stem.as_ref()) {
        format!("_{}", original_name)
    } else {
        original_name.to_string()
    };

    name = ILLEGAL_CHARS_RE.replace_all(&name, " ").into_owned();
    name = WHITESPACE_RE.replace_all(&name, " ").trim().to_string();
    name = name
        .trim_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string();
    if name.is_empty() {
        return "unnamed".to_string();
    }

    // 这里处理的是不带扩展名的文件名主体，直接按字节截断
    safe_truncate_utf8(&name, constants::MAX_FILENAME_BYTES)
        .trim_end()
        .to_string()
}

fn safe_truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut i = max_bytes;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    &s[..i]
}

/// 按显示宽度截断 (全角字符按 2 计)
pub fn truncate_text(text: &str, max_width: usize) -> String {
    let mut width = 0;
    let mut end_pos = 0;
    for (i, c) in text.char_indices() {
        width += if c.is_ascii() { 1 } else { 2 };
        if width > max_width.saturating_sub(3) {
            end_pos = i;
            break;
        }
    }
    if end_pos == 0 {
        text.to_string()
    } else {
        format!("{}...", &text[..end_pos])
    }
}

/// 解析 `1,3,5-7` / `all` 形式的选择，返回从 0 开始的下标。
pub fn parse_selection_indices(selection_str: &str, total_items: usize) -> Vec<usize> {
    if selection_str.trim().eq_ignore_ascii_case("all") {
        return (0..total_items).collect();
    }
    let mut indices = BTreeSet::new();
    for part in selection_str.split(',').map(|s| s.trim()) {
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>())
            {
                if start == 0 || end == 0 {
                    continue;
                }
                let (min, max) = (start.min(end), start.max(end));
                indices.extend((min..=max.min(total_items)).map(|i| i - 1));
            }
        } else if let Ok(num) = part.parse::<usize>()
            && num > 0
            && num <= total_items
        {
            indices.insert(num - 1);
        }
    }
    indices.into_iter().collect()
}

/// 秒数格式化为 `mm:ss`，超过一小时为 `h:mm:ss`
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// 在 PATH 中查找外部程序，找不到时原样返回程序名交给系统解析。
pub fn find_tool(name: &str) -> PathBuf {
    let file_name = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };
    env::var_os("PATH")
        .and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(&file_name))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| PathBuf::from(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_selection_indices() {
        // 基本情况
        assert_eq!(parse_selection_indices("1,3,5", 5), vec![0, 2, 4]);

        // 范围
        assert_eq!(parse_selection_indices("2-4", 5), vec![1, 2, 3]);

        // "all" 大小写不敏感
        assert_eq!(parse_selection_indices("all", 3), vec![0, 1, 2]);
        assert_eq!(parse_selection_indices("All", 3), vec![0, 1, 2]);

        // 越界与无效项被忽略，结果去重且有序
        assert_eq!(parse_selection_indices("5-1, 3, 9, x, 0", 4), vec![0, 1, 2, 3]);
        assert!(parse_selection_indices("", 3).is_empty());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c*d?"), "a b c d");
        assert_eq!(sanitize_filename("  ..hidden.. "), "hidden");
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("   "), "unknown");
        assert_eq!(sanitize_filename("【MV】 测试\t视频"), "【MV】 测试 视频");

        let long = "长".repeat(200);
        let cut = sanitize_filename(&long);
        assert!(cut.len() <= constants::MAX_FILENAME_BYTES);
        assert!(cut.chars().all(|c| c == '长'));
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("abcdefghijkl", 8), "abcde...");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(59), "00:59");
        assert_eq!(format_duration(754), "12:34");
        assert_eq!(format_duration(3723), "1:02:03");
    }
}
