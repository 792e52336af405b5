//! Quality scoring heuristics for extracted markdown
//!
//! Pure and deterministic: markdown in, verdict out. The score drives the
//! pipeline's decision to escalate to the browser renderer, so every
//! deduction here is deliberately cheap string inspection, no parsing.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Score plus the reasons behind it.
///
/// `issues` are weighted failures that can push a page under a threshold;
/// `warnings` are informational and never block acceptance on their own.
#[derive(Debug, Clone, Serialize)]
pub struct QualityVerdict {
    pub score: u8,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl QualityVerdict {
    /// Legacy validity check with a hardcoded cutoff of 60.
    ///
    /// The pipeline's accept/reject thresholds come from [`crate::pipeline::FetchOptions`]
    /// and may differ; callers that gate on this method are almost certainly
    /// wrong whenever `min_score != 60`.
    pub fn is_valid(&self) -> bool {
        self.score >= 60
    }
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());
static TABLE_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<t[rd]\b").unwrap());
static NEWLINE_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{5,}").unwrap());
static MARKDOWN_PUNCT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[#*\-_`\[\]()]").unwrap());

/// Phrases that mark a page as an error shell, bot check, or auth wall
/// rather than an article. Checked only on short documents; long real
/// articles mention these in passing.
static BOILERPLATE_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)page (could )?not (be )?found",
        r"(?i)error\s*404",
        r"(?i)404\s*[-–|:]?\s*not found",
        r"(?i)403 forbidden",
        r"(?i)internal server error",
        r"(?i)access denied",
        r"(?i)permission denied",
        r"(?i)this site can.?t be reached",
        r"(?i)subscribe to continue",
        r"(?i)subscription required",
        r"(?i)premium content",
        r"(?i)paywall",
        r"(?i)sign in to continue",
        r"(?i)log ?in to (continue|view|read)",
        r"(?i)please (sign|log) in",
        r"(?i)create (a free |an )?account to",
        r"(?i)register to (view|read|continue)",
        r"(?i)members.? only|member-only",
        r"(?i)enable javascript|javascript is (required|disabled)",
        r"(?i)captcha",
        r"(?i)verify (that )?you('re| are) (a )?human",
        r"(?i)are you a robot",
        r"(?i)checking your browser",
        r"(?i)unusual traffic",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Markdown with HTML tags and markdown punctuation removed, trimmed.
fn strip_markup(markdown: &str) -> String {
    let no_tags = TAG_RE.replace_all(markdown, "");
    let no_punct = MARKDOWN_PUNCT_RE.replace_all(&no_tags, "");
    no_punct.trim().to_string()
}

/// Score extracted markdown on a 0..=100 scale.
///
/// `source_html_len` is the byte length of the HTML the markdown was
/// derived from, when known; it enables the content-to-source ratio checks
/// that catch near-empty extractions from large pages.
pub fn score(markdown: &str, source_html_len: Option<usize>) -> QualityVerdict {
    let mut score: i32 = 100;
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    let stripped = strip_markup(markdown);
    let text_len = stripped.chars().count();

    if text_len == 0 {
        return QualityVerdict {
            score: 0,
            issues: vec!["extracted content is empty".to_string()],
            warnings,
        };
    }

    let tag_count = TAG_RE.find_iter(markdown).count();
    let table_tag_count = TABLE_TAG_RE.find_iter(markdown).count();

    let mut short_caught = false;
    if text_len < 50 {
        score -= 50;
        issues.push(format!("content is only {} characters", text_len));
        short_caught = true;
    }
    if text_len < 200 && (tag_count > 50 || table_tag_count > 20) {
        score -= 30;
        issues.push("short content dominated by unconverted markup".to_string());
        short_caught = true;
    }
    if !short_caught && text_len < 300 {
        score -= 15;
        warnings.push(format!("content is short ({} characters)", text_len));
    }

    if tag_count > 100 {
        score -= 40;
        issues.push(format!("{} HTML tags survived conversion", tag_count));
    } else if tag_count > 50 {
        score -= 20;
        warnings.push(format!("{} HTML tags survived conversion", tag_count));
    } else if tag_count > 10 {
        score -= 5;
        warnings.push(format!("{} HTML tags survived conversion", tag_count));
    }

    if table_tag_count > 50 {
        score -= 30;
        issues.push(format!("{} unconverted table cells", table_tag_count));
    }

    let total_chars = markdown.chars().count();
    if total_chars > 0 {
        let tag_chars: usize = TAG_RE
            .find_iter(markdown)
            .map(|m| m.as_str().chars().count())
            .sum();
        let ratio = tag_chars as f64 / total_chars as f64;
        if ratio > 0.30 {
            score -= 25;
            issues.push(format!("{:.0}% of content is raw HTML", ratio * 100.0));
        } else if ratio > 0.15 {
            score -= 10;
            warnings.push(format!("{:.0}% of content is raw HTML", ratio * 100.0));
        }
    }

    let lower = markdown.to_lowercase();
    if lower.contains("<script") {
        score -= 15;
        warnings.push("script tag present in output".to_string());
    }
    if lower.contains("<style") {
        score -= 10;
        warnings.push("style tag present in output".to_string());
    }

    if let Some(html_len) = source_html_len {
        if html_len > 10_000 {
            let ratio = text_len as f64 / html_len as f64;
            if ratio < 0.005 {
                score -= 35;
                issues.push(format!(
                    "extracted {} chars from {} bytes of HTML",
                    text_len, html_len
                ));
            } else if ratio < 0.02 {
                score -= 20;
                warnings.push(format!(
                    "extracted {} chars from {} bytes of HTML",
                    text_len, html_len
                ));
            }
        }
    }

    // Deliberately skipped above 2000 chars: long real articles may quote
    // phrases like "page not found" without being error pages.
    if text_len < 2000 {
        if let Some(re) = BOILERPLATE_RES.iter().find(|re| re.is_match(&stripped)) {
            score -= 40;
            issues.push(format!(
                "content looks like an error or access page (matched {})",
                re.as_str()
            ));
        }
    }

    if NEWLINE_RUN_RE.find_iter(markdown).count() > 10 {
        score -= 5;
        warnings.push("excessive blank-line runs".to_string());
    }

    QualityVerdict {
        score: score.clamp(0, 100) as u8,
        issues,
        warnings,
    }
}
