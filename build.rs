use std::path::{Path, PathBuf};
use std::process::Command;

const MAX_LINES: usize = 750;

const CHECKED_EXTENSIONS: &[&str] = &["rs", "md", "yaml", "toml"];

const EXCLUDED_DIRS: &[&str] = &["target", ".git", "examples"];

const EXCLUDED_FILES: &[&str] = &["Cargo.lock"];

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads/main");

    let sha = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()
        .and_then(|output| {
            if output.status.success() {
                String::from_utf8(output.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GEOPMD_GIT_SHA={}", sha);

    let root = PathBuf::from(
        std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR must be set"),
    );
    let files = collect_files_to_check(&root);
    for file in &files {
        println!("cargo:rerun-if-changed={}", file.display());
    }
    let sources: Vec<(PathBuf, String)> = files
        .iter()
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("rs")
                && p.file_name().and_then(|n| n.to_str()) != Some("build.rs")
        })
        .filter_map(|p| {
            let content = std::fs::read_to_string(p).ok()?;
            let rel = p.strip_prefix(&root).unwrap_or(p).to_path_buf();
            Some((rel, content))
        })
        .collect();

    enforce_line_limits(&root, &files);
    report(
        "#[allow(dead_code)] IS NOT ALLOWED",
        "Delete unused code, or gate test helpers behind #[cfg(test)].",
        find_dead_code_allows(&sources),
    );
    report(
        "SILENT TEST SKIPS ARE NOT ALLOWED",
        "Tests must FAIL if they cannot run, not silently pass.",
        find_test_skips(&sources),
    );
    report(
        "NESTED TOKIO RUNTIMES ARE NOT ALLOWED",
        "Use tokio::spawn() on the daemon runtime instead of a thread with its own runtime.",
        find_nested_runtimes(&sources),
    );
    report(
        "ENV MUTATIONS REQUIRE #[serial]",
        "Tests calling std::env::set_var/remove_var must carry #[serial].",
        find_unserialized_env_mutations(&sources),
    );
}

type Violation = (PathBuf, usize, String);

fn report(title: &str, advice: &str, violations: Vec<Violation>) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n========================================");
    eprintln!("{}", title);
    eprintln!("========================================");
    for (path, line, message) in &violations {
        eprintln!("  {}:{}", path.display(), line);
        eprintln!("    {}", message.trim());
    }
    eprintln!("========================================");
    eprintln!("{}", advice);
    eprintln!("========================================\n");
    panic!("Build failed: {} ({} occurrence(s))", title, violations.len());
}

fn enforce_line_limits(root: &Path, files: &[PathBuf]) {
    let mut violations = Vec::new();
    for file in files {
        match std::fs::read_to_string(file) {
            Ok(content) => {
                let count = content.lines().filter(|l| !l.trim().is_empty()).count();
                if count > MAX_LINES {
                    let rel = file.strip_prefix(root).unwrap_or(file).to_path_buf();
                    violations.push((rel, count, format!("exceeds by {}", count - MAX_LINES)));
                }
            }
            Err(e) => {
                println!("cargo:warning=Could not read file {}: {}", file.display(), e);
            }
        }
    }
    report(
        &format!("FILE LINE LIMIT EXCEEDED (max {} lines)", MAX_LINES),
        "Please split these files into smaller modules.",
        violations,
    );
}

fn collect_files_to_check(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    if let Ok(output) = Command::new("git")
        .args(["ls-files"])
        .current_dir(root)
        .output()
    {
        if output.status.success() {
            if let Ok(stdout) = String::from_utf8(output.stdout) {
                for line in stdout.lines() {
                    let path = root.join(line);
                    if should_check_file(&path, root) {
                        files.push(path);
                    }
                }
                return files;
            }
        }
    }

    walk_directory(root, root, &mut files);
    files
}

fn walk_directory(dir: &Path, root: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if EXCLUDED_DIRS.contains(&name) {
                    continue;
                }
            }
            walk_directory(&path, root, files);
        } else if should_check_file(&path, root) {
            files.push(path);
        }
    }
}

fn should_check_file(path: &Path, root: &Path) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(e) => e,
        None => return false,
    };
    if !CHECKED_EXTENSIONS.contains(&ext) {
        return false;
    }
    if let Ok(rel_path) = path.strip_prefix(root) {
        let rel_str = rel_path.to_string_lossy();
        if EXCLUDED_FILES.iter().any(|excluded| rel_str == *excluded) {
            return false;
        }
        for component in rel_path.components() {
            if let Some(name) = component.as_os_str().to_str() {
                if EXCLUDED_DIRS.contains(&name) {
                    return false;
                }
            }
        }
    }
    true
}

fn find_dead_code_allows(sources: &[(PathBuf, String)]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (path, content) in sources {
        for (i, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if (trimmed.starts_with("#[allow(") || trimmed.starts_with("#![allow("))
                && trimmed.contains("dead_code")
            {
                violations.push((path.clone(), i + 1, line.to_string()));
            }
        }
    }
    violations
}

/// A test function located by scanning for `#[test]` / `#[tokio::test]`.
struct TestFn {
    start: usize,
    name: String,
    serial: bool,
    body: Vec<(usize, String)>,
}

fn test_functions(content: &str) -> Vec<TestFn> {
    let lines: Vec<&str> = content.lines().collect();
    let mut tests = Vec::new();
    let mut serial = false;
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed == "#[serial]" || trimmed == "#[serial_test::serial]" {
            serial = true;
        }
        if trimmed == "#[test]" || trimmed.starts_with("#[tokio::test") {
            let header = (i + 1..lines.len().min(i + 5)).find(|j| lines[*j].contains("fn "));
            if let Some(j) = header {
                let after_fn = &lines[j][lines[j].find("fn ").unwrap_or(0) + 3..];
                let name = after_fn
                    .find('(')
                    .map(|paren| after_fn[..paren].trim().to_string())
                    .unwrap_or_default();
                let mut depth = 0i32;
                let mut body = Vec::new();
                let mut k = j;
                while k < lines.len() {
                    for c in lines[k].chars() {
                        match c {
                            '{' => depth += 1,
                            '}' => depth -= 1,
                            _ => {}
                        }
                    }
                    body.push((depth, lines[k].to_string()));
                    if depth == 0 && lines[k].contains('}') {
                        break;
                    }
                    k += 1;
                }
                let serial_after = lines[i..j].iter().any(|l| {
                    let t = l.trim();
                    t == "#[serial]" || t == "#[serial_test::serial]"
                });
                tests.push(TestFn {
                    start: i + 1,
                    name,
                    serial: serial || serial_after,
                    body: body
                        .into_iter()
                        .map(|(d, l)| (d.max(0) as usize, l))
                        .collect(),
                });
                serial = false;
                i = k;
            }
        }
        i += 1;
    }
    tests
}

fn find_test_skips(sources: &[(PathBuf, String)]) -> Vec<Violation> {
    let skip_patterns = ["Skipping test", "skipping test", "Test skipped", "test skipped"];
    let mut violations = Vec::new();
    for (path, content) in sources {
        for test in test_functions(content) {
            let skips = test.body.iter().any(|(depth, line)| {
                skip_patterns.iter().any(|p| line.contains(p))
                    || (line.trim() == "return;" && *depth > 1)
            });
            if skips {
                let message = format!("test `{}` silently skips", test.name);
                violations.push((path.clone(), test.start, message));
            }
        }
    }
    violations
}

fn find_nested_runtimes(sources: &[(PathBuf, String)]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (path, content) in sources {
        let lines: Vec<&str> = content.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if (trimmed.contains("std::thread::spawn") || trimmed.contains("thread::spawn("))
                && !trimmed.starts_with("//")
            {
                let end = (i + 20).min(lines.len());
                let context = lines[i..end].join("\n");
                if context.contains("Runtime::new()") || context.contains("runtime::Builder") {
                    violations.push((path.clone(), i + 1, line.to_string()));
                }
            }
        }
    }
    violations
}

fn find_unserialized_env_mutations(sources: &[(PathBuf, String)]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (path, content) in sources {
        for test in test_functions(content) {
            let mutates = test.body.iter().any(|(_, line)| {
                let t = line.trim();
                let touches_env = t.contains("env::set_var") || t.contains("env::remove_var");
                !t.starts_with("//") && touches_env
            });
            if mutates && !test.serial {
                let message = format!("test `{}` mutates env without #[serial]", test.name);
                violations.push((path.clone(), test.start, message));
            }
        }
    }
    violations
}
