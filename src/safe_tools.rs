use crate::tools::{fix_tool_input, ToolCall};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct SafeToolResult {
    pub call: ToolCall,
    pub input: Value,
    pub output: String,
    pub is_error: bool,
}

/// Runs one whitelisted tool call. Only `pwd`, a restricted `ls`, a
/// restricted `find`, and a single trailing `| head` are allowed; anything
/// else comes back as an is_error tool result, never a request failure.
pub fn execute_safe_tool(call: &ToolCall, workdir: &Path) -> SafeToolResult {
    let fixed = fix_tool_input(&call.input);
    let input: Value = serde_json::from_str(&fixed).unwrap_or_else(|_| Value::Object(Default::default()));

    let command = match input.get("command").and_then(|v| v.as_str()) {
        Some(cmd) if !cmd.trim().is_empty() => cmd.trim().to_string(),
        _ => {
            return SafeToolResult {
                call: call.clone(),
                input,
                output: "tool input missing command".to_string(),
                is_error: true,
            }
        }
    };

    match run_safe_command(workdir, &command) {
        Ok(output) => SafeToolResult {
            call: call.clone(),
            input,
            output,
            is_error: false,
        },
        Err(err) => SafeToolResult {
            call: call.clone(),
            input,
            output: err,
            is_error: true,
        },
    }
}

fn run_safe_command(workdir: &Path, command: &str) -> Result<String, String> {
    let mut outputs = Vec::new();
    for segment in command.split("&&") {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err("empty command segment".to_string());
        }
        outputs.push(run_safe_segment(workdir, segment)?);
    }
    Ok(outputs
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn run_safe_segment(workdir: &Path, segment: &str) -> Result<String, String> {
    let parts: Vec<&str> = segment.split('|').collect();
    if parts.len() > 2 {
        return Err("unsupported pipe usage".to_string());
    }
    let left = parts[0].trim();
    if left.is_empty() {
        return Err("empty command segment".to_string());
    }

    let mut output = run_safe_simple(workdir, left)?;
    if parts.len() == 2 {
        let right = parts[1].trim();
        if right.is_empty() {
            return Err("invalid pipe segment".to_string());
        }
        output = apply_head(right, &output)?;
    }
    Ok(output)
}

fn run_safe_simple(workdir: &Path, command: &str) -> Result<String, String> {
    let tokens = shlex::split(command).ok_or_else(|| "invalid command format".to_string())?;
    if tokens.is_empty() {
        return Err("invalid command format".to_string());
    }
    match tokens[0].as_str() {
        "pwd" => Ok(workdir.display().to_string()),
        "ls" => run_safe_ls(workdir, &tokens[1..]),
        "find" => run_safe_find(workdir, &tokens[1..]),
        other => Err(format!("command not allowed: {other}")),
    }
}

fn apply_head(segment: &str, input: &str) -> Result<String, String> {
    let tokens = shlex::split(segment).ok_or_else(|| "invalid head segment".to_string())?;
    if tokens.first().map(String::as_str) != Some("head") {
        return Err("only head pipe is supported".to_string());
    }
    let mut count = 10usize;
    if tokens.len() > 1 {
        let arg = tokens[1].as_str();
        let raw = if arg == "-n" {
            tokens
                .get(2)
                .ok_or_else(|| "missing head -n value".to_string())?
                .as_str()
        } else {
            arg.strip_prefix('-').unwrap_or(arg)
        };
        count = raw
            .parse::<usize>()
            .ok()
            .filter(|v| *v >= 1)
            .ok_or_else(|| "invalid head value".to_string())?;
    }
    let lines: Vec<&str> = input.split('\n').take(count).collect();
    Ok(lines.join("\n").trim().to_string())
}

fn run_safe_ls(workdir: &Path, args: &[String]) -> Result<String, String> {
    let mut flags = Vec::new();
    let mut path_arg: Option<&str> = None;
    for arg in args {
        if let Some(flag) = arg.strip_prefix('-') {
            match flag {
                "a" | "l" | "la" | "al" => flags.push(arg.as_str()),
                _ => return Err(format!("ls flag not allowed: {arg}")),
            }
        } else {
            if path_arg.is_some() {
                return Err("ls supports a single path argument".to_string());
            }
            path_arg = Some(arg);
        }
    }

    let target = match path_arg {
        Some(path) => resolve_path(workdir, path),
        None => workdir.to_path_buf(),
    };

    let output = Command::new("ls")
        .args(&flags)
        .arg(&target)
        .current_dir(workdir)
        .output()
        .map_err(|e| format!("failed to run ls: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{stdout}{stderr}");
    let combined = combined.trim();
    if !output.status.success() && combined.is_empty() {
        return Err(format!("ls exited with {}", output.status));
    }
    Ok(combined.to_string())
}

fn run_safe_find(workdir: &Path, args: &[String]) -> Result<String, String> {
    let mut args = args;
    let mut start = ".".to_string();
    if let Some(first) = args.first() {
        if !first.starts_with('-') {
            start = first.clone();
            args = &args[1..];
        }
    }
    let root = resolve_path(workdir, &start);

    let mut max_depth: Option<usize> = None;
    let mut type_filters: Vec<char> = Vec::new();
    let mut name_patterns: Vec<String> = Vec::new();
    let mut exclude_hidden = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-maxdepth" => {
                let raw = args
                    .get(i + 1)
                    .ok_or_else(|| "missing value for -maxdepth".to_string())?;
                max_depth = Some(
                    raw.parse::<usize>()
                        .map_err(|_| "invalid -maxdepth".to_string())?,
                );
                i += 2;
            }
            "-type" => {
                let raw = args
                    .get(i + 1)
                    .ok_or_else(|| "missing value for -type".to_string())?;
                match raw.as_str() {
                    "f" => type_filters.push('f'),
                    "d" => type_filters.push('d'),
                    _ => return Err("only -type f/d supported".to_string()),
                }
                i += 2;
            }
            "-name" => {
                let pattern = args
                    .get(i + 1)
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| "invalid -name pattern".to_string())?;
                if pattern.contains('/') {
                    return Err("invalid -name pattern".to_string());
                }
                name_patterns.push(pattern);
                i += 2;
            }
            "-o" => {
                i += 1;
            }
            "-not" => {
                if args.get(i + 1).map(String::as_str) != Some("-path") {
                    return Err("only -not -path supported".to_string());
                }
                let pattern = args
                    .get(i + 2)
                    .ok_or_else(|| "invalid -not syntax".to_string())?;
                if pattern == "*/.*" || pattern == r"*/\.*" {
                    exclude_hidden = true;
                } else {
                    return Err("unsupported -not -path pattern".to_string());
                }
                i += 3;
            }
            other => return Err(format!("unsupported find option: {other}")),
        }
    }

    let mut walker = WalkDir::new(&root).min_depth(0);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }

    let mut lines = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let rel = path.strip_prefix(&root).unwrap_or(path);
        let rel_display = if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            format!("./{}", rel.display())
        };
        if exclude_hidden && is_hidden_rel(rel) {
            continue;
        }
        let is_dir = entry.file_type().is_dir();
        if !type_filters.is_empty() {
            if is_dir && !type_filters.contains(&'d') {
                continue;
            }
            if !is_dir && !type_filters.contains(&'f') {
                continue;
            }
        }
        if !name_patterns.is_empty() {
            let name = entry.file_name().to_string_lossy();
            if !name_patterns.iter().any(|p| glob_match(p, &name)) {
                continue;
            }
        }
        lines.push(rel_display);
    }
    Ok(lines.join("\n"))
}

fn is_hidden_rel(rel: &Path) -> bool {
    rel.components().any(|c| {
        c.as_os_str()
            .to_string_lossy()
            .starts_with('.')
    })
}

fn resolve_path(workdir: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    if path == "." {
        return workdir.to_path_buf();
    }
    workdir.join(candidate)
}

/// Minimal `*`/`?` glob over file names, enough for find -name patterns.
fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[char], n: &[char]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    inner(&p, &n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn call(input: &str) -> ToolCall {
        ToolCall {
            id: "tool_1".to_string(),
            name: "bash".to_string(),
            input: input.to_string(),
        }
    }

    fn sandbox() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        fs::write(dir.path().join("src/nested/mod.rs"), "").unwrap();
        fs::write(dir.path().join("README.md"), "# readme").unwrap();
        fs::write(dir.path().join(".hidden/secret.txt"), "x").unwrap();
        dir
    }

    #[test]
    fn pwd_returns_workdir() {
        let dir = sandbox();
        let result = execute_safe_tool(&call(r#"{"command":"pwd"}"#), dir.path());
        assert!(!result.is_error);
        assert_eq!(result.output, dir.path().display().to_string());
    }

    #[test]
    fn find_filters_by_depth_type_and_name() {
        let dir = sandbox();
        let result = execute_safe_tool(
            &call(r#"{"command":"find . -maxdepth 2 -type f -name \"*.rs\""}"#),
            dir.path(),
        );
        assert!(!result.is_error, "unexpected error: {}", result.output);
        let mut lines: Vec<&str> = result.output.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["./src/lib.rs", "./src/main.rs"]);
    }

    #[test]
    fn find_excludes_hidden_paths() {
        let dir = sandbox();
        let result = execute_safe_tool(
            &call(r#"{"command":"find . -type f -not -path \"*/.*\""}"#),
            dir.path(),
        );
        assert!(!result.is_error);
        assert!(!result.output.contains("secret.txt"));
        assert!(result.output.contains("./README.md"));
    }

    #[test]
    fn head_pipe_limits_lines() {
        let dir = sandbox();
        let result = execute_safe_tool(
            &call(r#"{"command":"find . -type f | head -n 2"}"#),
            dir.path(),
        );
        assert!(!result.is_error);
        assert!(result.output.lines().count() <= 2);
    }

    #[test]
    fn disallowed_commands_become_tool_errors() {
        let dir = sandbox();
        for bad in [
            r#"{"command":"rm -rf /"}"#,
            r#"{"command":"find . -exec rm {} ;"}"#,
            r#"{"command":"ls -R"}"#,
            r#"{"command":"find . | grep foo"}"#,
            r#"{"command":"a | b | c"}"#,
        ] {
            let result = execute_safe_tool(&call(bad), dir.path());
            assert!(result.is_error, "expected error for {bad}");
        }
    }

    #[test]
    fn truncated_input_is_repaired_before_parsing() {
        let dir = sandbox();
        let result = execute_safe_tool(&call(r#"{"command":"pwd""#), dir.path());
        assert!(!result.is_error);
        assert_eq!(result.output, dir.path().display().to_string());
    }

    #[test]
    fn missing_command_reports_error() {
        let dir = sandbox();
        let result = execute_safe_tool(&call(r#"{"description":"no command"}"#), dir.path());
        assert!(result.is_error);
        assert!(result.output.contains("missing command"));
    }

    #[test]
    fn glob_match_covers_star_and_question() {
        assert!(glob_match("*.rs", "main.rs"));
        assert!(glob_match("ma?n.rs", "main.rs"));
        assert!(!glob_match("*.go", "main.rs"));
        assert!(glob_match("*", "anything"));
    }
}
