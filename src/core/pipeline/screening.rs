//! Static deny-list scan run before any process is spawned.
//!
//! This is a cost control and a first line of defense only. Pattern scans
//! can be defeated by obfuscation or reflection; the sandbox is what
//! actually contains submitted code.

use std::borrow::Cow;
use std::collections::HashMap;

use regex::Regex;

use crate::core::{domain::Language, errors::ConfigError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityVerdict {
    pub safe: bool,
    /// Operator-facing; never returned to the submitter.
    pub reason: Option<String>,
}

impl SecurityVerdict {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone, Debug)]
struct DenyRule {
    pattern: Regex,
    reason: String,
}

const PY_MODULES: &str = "os|sys|subprocess|socket|shutil|pathlib|ctypes|cffi|multiprocessing|\
    threading|_thread|signal|importlib|builtins|pty|io|glob|tempfile|pickle|marshal|shelve|\
    urllib|http|ftplib|smtplib|requests|asyncio|resource|gc|inspect|code|codeop|posix|fcntl|mmap|\
    select|selectors|platform|sysconfig|runpy|zipimport";

const PYTHON_RULES: &[(&str, &str)] = &[
    (
        r"(?m)(?:^|;)\s*import\s+(?:[\w.]+(?:\s+as\s+\w+)?\s*,\s*)*(?:{PY})\b",
        "import of a restricted module",
    ),
    (
        r"(?m)(?:^|;)\s*from\s+(?:{PY})\b[\w.]*\s+import\b",
        "import from a restricted module",
    ),
    (r"__import__", "dynamic import"),
    (
        r"(?:^|[^.\w])(?:eval|exec|compile|open|getattr|setattr|delattr|globals|locals|vars|breakpoint|memoryview)\s*\(",
        "call to a dynamic-evaluation or reflection builtin",
    ),
    (
        r"__(?:class|bases|base|subclasses|mro|globals|builtins|code|closure|dict|getattribute|loader|spec|reduce|reduce_ex)__",
        "dunder reflection attribute",
    ),
];

const JAVASCRIPT_RULES: &[(&str, &str)] = &[
    (r"\brequire\s*\(", "module loading via require"),
    (r#"(?m)(?:^|[^.\w])import\s*(?:[({*'"]|\w+\s+from\b|\{)"#, "module import"),
    (r"\bprocess\s*(?:\.|\[)", "access to the process object"),
    (r"(?:^|[^.\w])eval\s*\(", "dynamic evaluation"),
    (r"\b(?:new\s+)?Function\s*\(", "function constructor"),
    (
        r"\b(?:globalThis|global|__dirname|__filename|Deno|Bun)\b",
        "access to the global scope",
    ),
    (r#"\.\s*constructor\b|\[\s*['"`]constructor['"`]\s*\]"#, "constructor chain"),
    (r"__proto__|\bReflect\s*\.|\bProxy\s*\(", "prototype manipulation"),
    (
        r"\b(?:WebAssembly|fetch|XMLHttpRequest|WebSocket|SharedArrayBuffer|Atomics)\b",
        "restricted runtime API",
    ),
    (
        r"child_process|worker_threads|\bnode:",
        "restricted module name",
    ),
];

const C_FAMILY_RULES: &[(&str, &str)] = &[
    (
        r"(?m)^\s*#\s*include\s*<(?:unistd\.h|sys/[\w./]+|fcntl\.h|dirent\.h|dlfcn\.h|signal\.h|csignal|spawn\.h|pthread\.h|thread|future|filesystem|fstream|netinet/[\w./]+|arpa/[\w./]+|netdb\.h|pwd\.h|grp\.h|termios\.h|sched\.h|syscall\.h|linux/[\w./]+)>",
        "include of a system header",
    ),
    (r#"(?m)^\s*#\s*include\s*""#, "include of a local file"),
    (
        r"(?:^|[^.\w])(?:system|popen|fork|vfork|clone|execl|execlp|execle|execv|execvp|execvpe|execve|socket|connect|fopen|freopen|fdopen|open|openat|creat|unlink|rmdir|mkdir|kill|ptrace|syscall|dlopen|mmap|mprotect|chmod|chown|chdir|chroot|setuid|setgid)\s*\(",
        "call to a process, file, or network primitive",
    ),
    (r"\b(?:std::)?(?:i|o)?fstream\b", "file stream"),
    (r"\b(?:asm|__asm__|__asm)\b", "inline assembly"),
];

const COMMON_RULES: &[(&str, &str)] = &[
    (r"/bin/(?:ba|z|da)?sh\b|/usr/bin/", "shell or system binary path"),
    (r"/etc/|/proc/|/sys/|/dev/(?:tcp|udp)/", "system path"),
    (r"\brm\s+-[a-zA-Z]*[rf]", "shell escape sequence"),
];

#[derive(Clone, Debug)]
pub struct Screener {
    max_source_bytes: usize,
    rules: HashMap<Language, Vec<DenyRule>>,
}

impl Screener {
    pub fn new(max_source_bytes: usize) -> Result<Self, ConfigError> {
        let mut rules = HashMap::new();
        for language in Language::ALL {
            let builtin = match language {
                Language::Python => PYTHON_RULES,
                Language::JavaScript => JAVASCRIPT_RULES,
                Language::Cpp | Language::C => C_FAMILY_RULES,
            };
            let mut compiled = compile_rules(language, COMMON_RULES)?;
            compiled.extend(compile_rules(language, builtin)?);
            rules.insert(language, compiled);
        }
        Ok(Self {
            max_source_bytes,
            rules,
        })
    }

    /// Adds operator-configured patterns for one language.
    pub fn with_patterns(mut self, language: Language, patterns: &[String]) -> Result<Self, ConfigError> {
        let extra = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map(|regex| DenyRule {
                        pattern: regex,
                        reason: format!("configured pattern {pattern:?}"),
                    })
                    .map_err(|source| ConfigError::DenyPattern {
                        language,
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.rules.entry(language).or_default().extend(extra);
        Ok(self)
    }

    #[tracing::instrument(skip(self, source_code), fields(bytes = source_code.len()))]
    pub fn screen(&self, source_code: &str, language: Language) -> SecurityVerdict {
        if source_code.len() > self.max_source_bytes {
            return SecurityVerdict::rejected(format!(
                "source is {} bytes, limit is {}",
                source_code.len(),
                self.max_source_bytes
            ));
        }

        let rules = self.rules.get(&language).map(Vec::as_slice).unwrap_or(&[]);
        let views = match language {
            Language::Cpp | Language::C => preprocessed_views(source_code),
            Language::Python | Language::JavaScript => vec![Cow::Borrowed(source_code)],
        };
        for (view, text) in views.iter().enumerate() {
            for rule in rules {
                if let Some(found) = rule.pattern.find(text) {
                    tracing::debug!(matched = found.as_str().trim(), view, "Deny rule matched");
                    let place = if view == 0 { "" } else { " after preprocessing" };
                    return SecurityVerdict::rejected(format!(
                        "{} at byte {}{place}",
                        rule.reason,
                        found.start()
                    ));
                }
            }
        }

        SecurityVerdict::safe()
    }
}

/// The raw source, the source after translation phases 1 and 2, and that
/// text with comments replaced by spaces. Rules see each one in turn, so
/// `sys\<newline>tem(` or `system/**/(` read as the call they compile to.
fn preprocessed_views(source: &str) -> Vec<Cow<'_, str>> {
    let spliced = splice_lines(&replace_alternative_tokens(source));
    let uncommented = strip_comments(&spliced);
    let mut views = vec![Cow::Borrowed(source)];
    if spliced != source {
        views.push(Cow::Owned(spliced));
    }
    if uncommented != *views[views.len() - 1] {
        views.push(Cow::Owned(uncommented));
    }
    views
}

/// Trigraphs that rebuild a backslash or `#`, and the `%:` digraph.
fn replace_alternative_tokens(source: &str) -> String {
    source
        .replace("??/", "\\")
        .replace("??=", "#")
        .replace("%:", "#")
}

/// Joins physical lines ending in a backslash.
fn splice_lines(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(at) = rest.find('\\') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        let trimmed = after.trim_start_matches([' ', '\t']);
        if let Some(next) = trimmed.strip_prefix("\r\n").or_else(|| trimmed.strip_prefix('\n')) {
            rest = next;
        } else {
            out.push('\\');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// Replaces `/* */` and `//` comments with a space, leaving string and
/// character literals alone.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                out.push(c);
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if inner == c || inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for inner in chars.by_ref() {
                    if previous == '*' && inner == '/' {
                        break;
                    }
                    previous = inner;
                }
                out.push(' ');
            }
            '/' if chars.peek() == Some(&'/') => {
                for inner in chars.by_ref() {
                    if inner == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn compile_rules(language: Language, rules: &[(&str, &str)]) -> Result<Vec<DenyRule>, ConfigError> {
    rules
        .iter()
        .map(|(pattern, reason)| {
            let pattern = pattern.replace("{PY}", PY_MODULES);
            Regex::new(&pattern)
                .map(|regex| DenyRule {
                    pattern: regex,
                    reason: reason.to_string(),
                })
                .map_err(|source| ConfigError::DenyPattern {
                    language,
                    pattern,
                    source,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screener() -> Screener {
        Screener::new(64 * 1024).unwrap()
    }

    fn rejected(source: &str, language: Language) -> bool {
        !screener().screen(source, language).safe
    }

    #[test]
    fn test_clean_solutions_pass() {
        let python = "import math\nfrom collections import Counter\n\ndef solution(a, b):\n    return math.gcd(a, b)\n";
        assert_eq!(screener().screen(python, Language::Python), SecurityVerdict::safe());

        let python_stdin = "import re\nif __name__ == '__main__':\n    n = int(input())\n    print(re.compile(r'\\d').sub('', str(n)))\n";
        assert!(!rejected(python_stdin, Language::Python));

        let js = "function solution(nums) {\n  return nums.map(x => x * 2);\n}\nmodule.exports = { solution };\n";
        assert!(!rejected(js, Language::JavaScript));

        let cpp = "#include <bits/stdc++.h>\nusing namespace std;\nint main() { long long a, b; cin >> a >> b; cout << a + b << endl; }\n";
        assert!(!rejected(cpp, Language::Cpp));

        let c = "#include <stdio.h>\nint main(void) { int a; scanf(\"%d\", &a); printf(\"%d\\n\", a); return 0; }\n";
        assert!(!rejected(c, Language::C));
    }

    #[test]
    fn test_python_restricted_imports() {
        assert!(rejected("import os\n", Language::Python));
        assert!(rejected("import math, subprocess\n", Language::Python));
        assert!(rejected("import socket as s\n", Language::Python));
        assert!(rejected("from os.path import join\n", Language::Python));
        assert!(rejected("x = 1; import sys\n", Language::Python));
        assert!(rejected("m = __import__('os')\n", Language::Python));
        assert!(!rejected("import osmosis_helpers\n", Language::Python));
    }

    #[test]
    fn test_python_eval_and_reflection() {
        assert!(rejected("def solution():\n    return eval('1+1')\n", Language::Python));
        assert!(rejected("open('/tmp/x').read()\n", Language::Python));
        assert!(rejected("().__class__.__bases__[0].__subclasses__()\n", Language::Python));
        assert!(!rejected("pattern = re.compile('a+')\n", Language::Python));
    }

    #[test]
    fn test_javascript_rules() {
        assert!(rejected("const fs = require('fs');", Language::JavaScript));
        assert!(rejected("import fs from 'fs';", Language::JavaScript));
        assert!(rejected("const m = await import('fs');", Language::JavaScript));
        assert!(rejected("process.exit(0);", Language::JavaScript));
        assert!(rejected("new Function('return this')()", Language::JavaScript));
        assert!(rejected("[].constructor.constructor('x')", Language::JavaScript));
        assert!(rejected("globalThis.x = 1;", Language::JavaScript));
        assert!(!rejected("function processItems(items) { return items; }", Language::JavaScript));
        assert!(!rejected("class A { constructor(x) { this.x = x; } }", Language::JavaScript));
    }

    #[test]
    fn test_c_family_rules() {
        assert!(rejected("#include <unistd.h>\nint main(){fork();}", Language::C));
        assert!(rejected("#include \"../../etc/passwd\"\n", Language::Cpp));
        assert!(rejected("int main(){ std::system(\"ls\"); }", Language::Cpp));
        assert!(rejected("int main(){ FILE* f = fopen(\"x\", \"r\"); }", Language::C));
        assert!(rejected("#include <fstream>\n", Language::Cpp));
        assert!(rejected("int main(){ asm(\"nop\"); }", Language::C));
        assert!(!rejected("int main(){ std::vector<int> v; v.push_back(1); }", Language::Cpp));
    }

    #[test]
    fn test_line_splices_do_not_hide_calls() {
        assert!(rejected("int main(){ FILE* f = fo\\\npen(\"x\", \"r\"); }", Language::C));
        assert!(rejected("int main(){ sys\\\r\ntem(\"ls\"); }", Language::Cpp));
        assert!(rejected("int main(){ sys\\  \ntem(\"ls\"); }", Language::Cpp));
        assert!(rejected("#\\\ninclude <unistd.h>\n", Language::C));

        let verdict = screener().screen("int main(){ sys\\\ntem(\"ls\"); }", Language::C);
        assert!(verdict.reason.unwrap().ends_with("after preprocessing"));
    }

    #[test]
    fn test_comments_and_alternative_tokens_do_not_hide_calls() {
        assert!(rejected("int main(){ system/**/(\"ls\"); }", Language::Cpp));
        assert!(rejected("int main(){ system // x\n (\"ls\"); }", Language::C));
        assert!(rejected("int main(){ sys??/\ntem(\"ls\"); }", Language::C));
        assert!(rejected("%:include <unistd.h>\n", Language::C));
        assert!(rejected("??=include <sys/socket.h>\n", Language::Cpp));
    }

    #[test]
    fn test_preprocessing_keeps_literals() {
        let source = "#include <stdio.h>\nint main(void) {\n    printf(\"a // b /* c\\n\");\n    puts(\"line \\\n    two\");\n    return 0;\n}\n";
        assert!(!rejected(source, Language::C));
        assert_eq!(strip_comments("x = '\"'; // tail\ny"), "x = '\"'; \ny");
        assert_eq!(splice_lines("a\\\nb \\n"), "ab \\n");
    }

    #[test]
    fn test_common_rules_apply_to_every_language() {
        for language in Language::ALL {
            assert!(rejected("s = '/etc/passwd'", language));
            assert!(rejected("// rm -rf /", language));
        }
    }

    #[test]
    fn test_oversized_source_rejected() {
        let screener = Screener::new(16).unwrap();
        let verdict = screener.screen("def solution():\n    return 1\n", Language::Python);
        assert!(!verdict.safe);
        assert!(verdict.reason.unwrap().contains("limit is 16"));
    }

    #[test]
    fn test_configured_patterns() {
        let screener = screener()
            .with_patterns(Language::Python, &[r"\bwhile\s+True\b".to_string()])
            .unwrap();
        assert!(!screener.screen("while True:\n    pass\n", Language::Python).safe);
        assert!(screener.screen("while True:\n    pass\n", Language::C).safe);

        let invalid = screener.with_patterns(Language::C, &["(".to_string()]);
        assert!(matches!(invalid, Err(ConfigError::DenyPattern { .. })));
    }
}
