/// Device prompt extraction: scan login output lines for the verification
/// URL and one-time code.
///
/// The wrapped CLI prints its prompt as human-facing text, e.g.
/// - GitHub: `log into https://github.com/login/device and use code 1A2B-3C4D`
/// - Microsoft: `open the page https://microsoft.com/devicelogin and enter the code H7QK2ZP9B`
///
/// The wording changes between releases, so the regexes live in
/// `[patterns]` config and carry a version string.
use crate::config::PatternConfig;
use regex::Regex;
use std::sync::LazyLock;

/// ANSI CSI/OSC escape sequences emitted by colored terminal output.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").unwrap()
});

/// A device code and, when the CLI printed one, the page to enter it on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePrompt {
    pub code: String,
    pub url: Option<String>,
}

/// Invalid pattern configuration.
#[derive(Debug)]
pub struct PatternError {
    pub pattern: String,
    pub source: regex::Error,
}

impl std::fmt::Display for PatternError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid prompt pattern {:?}: {}", self.pattern, self.source)
    }
}

impl std::error::Error for PatternError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Compiled, versioned prompt patterns.
#[derive(Debug, Clone)]
pub struct PromptPatterns {
    version: String,
    url: Vec<Regex>,
    code: Vec<Regex>,
    require_url: bool,
}

impl PromptPatterns {
    pub fn compile(config: &PatternConfig) -> Result<Self, PatternError> {
        fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, PatternError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| PatternError {
                        pattern: p.clone(),
                        source: e,
                    })
                })
                .collect()
        }

        Ok(Self {
            version: config.version.clone(),
            url: compile_all(&config.url)?,
            code: compile_all(&config.code)?,
            require_url: config.require_url,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Start a fresh matcher for one login session.
    pub fn matcher(&self) -> PromptMatcher<'_> {
        PromptMatcher {
            patterns: self,
            url: None,
            code: None,
            emitted: false,
        }
    }
}

/// Per-session matching state.
///
/// Holds partial results when the URL and the code are printed on
/// different lines, and refuses to emit more than once.
#[derive(Debug)]
pub struct PromptMatcher<'a> {
    patterns: &'a PromptPatterns,
    url: Option<String>,
    code: Option<String>,
    emitted: bool,
}

impl PromptMatcher<'_> {
    /// Feed one completed output line.
    ///
    /// Returns the prompt the first time it becomes complete, `None` otherwise.
    pub fn feed(&mut self, line: &str) -> Option<DevicePrompt> {
        let clean = strip_ansi(line);

        if self.emitted {
            if find_capture(&self.patterns.code, &clean, "code").is_some() {
                tracing::debug!(line = %clean, "device prompt already emitted, ignoring repeat");
            }
            return None;
        }

        if self.url.is_none() {
            if let Some(url) = find_capture(&self.patterns.url, &clean, "url") {
                let url = trim_url(&url).to_string();
                tracing::debug!(%url, "verification URL seen");
                self.url = Some(url);
            }
        }
        if self.code.is_none() {
            if let Some(code) = find_capture(&self.patterns.code, &clean, "code") {
                tracing::debug!("device code seen");
                self.code = Some(code);
            }
        }

        let code = self.code.as_ref()?;
        if self.patterns.require_url && self.url.is_none() {
            tracing::debug!("device code seen, waiting for verification URL");
            return None;
        }

        self.emitted = true;
        Some(DevicePrompt {
            code: code.clone(),
            url: self.url.clone(),
        })
    }

    /// Whether a prompt has already been returned by `feed`.
    pub fn emitted(&self) -> bool {
        self.emitted
    }
}

/// First pattern that matches wins; the named group is preferred over the whole match.
fn find_capture(patterns: &[Regex], text: &str, group: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let m = caps.name(group).or_else(|| caps.get(0))?;
        Some(m.as_str().to_string())
    })
}

fn trim_url(url: &str) -> &str {
    url.trim_end_matches(['.', ',', ';', ':', ')', '\'', '"'])
}

pub fn strip_ansi(line: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(line, "")
}
