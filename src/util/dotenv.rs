//! `.env` 读写。
//!
//! 启动时加载到进程环境变量；运行期只读取文件内容，管理接口修改配置时按 key 原地改写。

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// 从当前目录向上查找 `.env` 并写入进程环境变量。
pub fn load() {
    for (key, value) in read() {
        // 已显式设置的环境变量优先。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 只在启动阶段、创建任何任务和 HTTP 客户端之前调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

/// 读取 `.env` 的键值（不存在时为空），不修改进程环境变量。
pub fn read() -> BTreeMap<String, String> {
    let Some(path) = find() else {
        return BTreeMap::new();
    };
    let Ok(file) = std::fs::File::open(&path) else {
        return BTreeMap::new();
    };
    std::io::BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| parse_line(&line))
        .collect()
}

fn find() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

/// 把 updates 写回 `.env`：已有 key 原地替换，不存在的追加到末尾。
pub fn persist(updates: &[(&str, String)]) -> std::io::Result<PathBuf> {
    let path = match find() {
        Some(p) => p,
        None => std::env::current_dir()?.join(".env"),
    };

    let mut lines: Vec<String> = if path.exists() {
        let file = std::fs::File::open(&path)?;
        std::io::BufReader::new(file)
            .lines()
            .collect::<Result<Vec<_>, _>>()?
    } else {
        Vec::new()
    };

    let mut written = vec![false; updates.len()];
    for line in lines.iter_mut() {
        let Some((key, _)) = parse_line(line) else {
            continue;
        };
        if let Some(i) = updates.iter().position(|(k, _)| *k == key) {
            *line = format_line(updates[i].0, &updates[i].1);
            written[i] = true;
        }
    }
    for (i, (key, value)) in updates.iter().enumerate() {
        if !written[i] {
            lines.push(format_line(key, value));
        }
    }

    let mut file = std::fs::File::create(&path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(path)
}

pub fn parse_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let raw = line[eq_idx + 1..].trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == b'"' && last == b'"' {
            return Some((key.to_string(), unescape_double_quoted(&raw[1..raw.len() - 1])));
        }
        if first == b'\'' && last == b'\'' {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t') {
            return &value[..i];
        }
    }
    value
}

/// 双引号内只识别 `\"` 与 `\\` 两种转义，其余反斜杠原样保留。
fn unescape_double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(n @ ('"' | '\\')) => out.push(n),
            Some(n) => {
                out.push('\\');
                out.push(n);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn format_line(key: &str, value: &str) -> String {
    if value.is_empty() || value.contains([' ', '\t', '"', '\'', '#']) {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("{key}=\"{escaped}\"")
    } else {
        format!("{key}={value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_handles_quotes_export_and_comments() {
        assert_eq!(
            parse_line("export API_KEY=\"sk 1\""),
            Some(("API_KEY".to_string(), "sk 1".to_string()))
        );
        assert_eq!(
            parse_line("PORT=8080 # 端口"),
            Some(("PORT".to_string(), "8080".to_string()))
        );
        assert_eq!(
            parse_line("Z_AI_COOKIES=a#b,c"),
            Some(("Z_AI_COOKIES".to_string(), "a#b,c".to_string()))
        );
        assert_eq!(parse_line("# comment"), None);
        assert_eq!(parse_line("=value"), None);
    }

    #[test]
    fn format_line_quotes_when_needed() {
        assert_eq!(format_line("KEY", "value"), "KEY=value");
        assert_eq!(format_line("KEY", "with space"), "KEY=\"with space\"");
        assert_eq!(format_line("KEY", ""), "KEY=\"\"");
    }

    #[test]
    fn quoted_values_survive_write_and_read() {
        for value in [r#"say "hi""#, r#"C:\dir "x""#, "it's # here", r"trail\"] {
            let line = format_line("KEY", value);
            assert_eq!(
                parse_line(&line),
                Some(("KEY".to_string(), value.to_string())),
                "line: {line}"
            );
        }
    }
}
