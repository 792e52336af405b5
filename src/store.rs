//! File-backed reference store
//!
//! Each reference is one markdown file with a frontmatter header, living in
//! a temporary directory until promoted into the permanent one. Files are
//! written complete-then-renamed so a concurrent `list` never observes a
//! half-written reference.

use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::Error;

/// Lifecycle stage of a stored reference, one directory per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefStatus {
    Temporary,
    Permanent,
}

impl std::fmt::Display for RefStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefStatus::Temporary => write!(f, "temporary"),
            RefStatus::Permanent => write!(f, "permanent"),
        }
    }
}

/// A persisted fetch result.
#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub ref_id: String,
    pub title: String,
    pub url: String,
    pub fetched_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub status: RefStatus,
    #[serde(skip_serializing)]
    pub body: String,
}

/// Outcome of [`ReferenceStore::save`].
#[derive(Debug, Clone, Serialize)]
pub struct SaveResult {
    pub ref_id: String,
    pub path: PathBuf,
    pub already_exists: bool,
}

/// Outcome of [`ReferenceStore::promote`].
#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// An inline markdown link found in a reference body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedLink {
    pub text: String,
    pub href: String,
}

/// Frontmatter fields, parsed line by line. Deliberately more lenient than
/// a YAML parser: a sanitized URL may still contain characters (like `: `)
/// that strict YAML rejects, and such files must stay readable.
#[derive(Debug, Default)]
struct Header {
    title: Option<String>,
    source_url: Option<String>,
    fetched_date: Option<String>,
    status: Option<String>,
    query: Option<String>,
}

fn parse_header_block(block: &str) -> Header {
    let mut header = Header::default();
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = unquote(value);
        match key.trim() {
            "title" => header.title = Some(value),
            "source_url" => header.source_url = Some(value),
            "fetched_date" => header.fetched_date = Some(value),
            "status" => header.status = Some(value),
            "query" => header.query = Some(value),
            _ => {}
        }
    }
    header
}

/// Strip the quoted-string encoding written by [`escape_quoted`].
fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1].replace("\\\"", "\"")
    } else {
        value.to_string()
    }
}

static INLINE_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^\s\)]+)\)").unwrap());

/// Reference store rooted at a base directory with `temporary` and
/// `permanent` subdirectories of identical file shape.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    temp_dir: PathBuf,
    permanent_dir: PathBuf,
}

impl ReferenceStore {
    pub fn open(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            temp_dir: base.join("temporary"),
            permanent_dir: base.join("permanent"),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn permanent_dir(&self) -> &Path {
        &self.permanent_dir
    }

    /// Persist a fetch result, deduplicating by exact source URL.
    ///
    /// An existing reference for the same URL is returned untouched unless
    /// `refetch` is set, in which case the same file is overwritten in place
    /// (same ref_id, same path) with the new title, body, and date.
    pub async fn save(
        &self,
        title: &str,
        url: &str,
        body: &str,
        query: Option<&str>,
        refetch: bool,
    ) -> Result<SaveResult, Error> {
        fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| Error::io(self.temp_dir.display().to_string(), e))?;

        let url = sanitize_url(url);

        if let Some((existing, path)) = self.find_in_dir_by_url(&self.temp_dir, &url).await? {
            if !refetch {
                debug!(ref_id = %existing.ref_id, "reference already stored");
                return Ok(SaveResult {
                    ref_id: existing.ref_id,
                    path,
                    already_exists: true,
                });
            }
            let query = query.or(existing.query.as_deref());
            write_reference(&path, title, &url, query, RefStatus::Temporary, body).await?;
            return Ok(SaveResult {
                ref_id: existing.ref_id,
                path,
                already_exists: false,
            });
        }

        let ref_id = slugify(title);
        let path = self.temp_dir.join(format!("{}.md", ref_id));
        // Distinct titles can slugify identically; the newer file silently
        // replaces the older one.
        write_reference(&path, title, &url, query, RefStatus::Temporary, body).await?;

        Ok(SaveResult {
            ref_id,
            path,
            already_exists: false,
        })
    }

    /// List references in one directory, newest fetch date first.
    ///
    /// Files without a parsable frontmatter header are skipped silently.
    pub async fn list(&self, status: RefStatus) -> Result<Vec<Reference>, Error> {
        let dir = self.dir_for(status);
        let mut refs = Vec::new();

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
            Err(e) => return Err(Error::io(dir.display().to_string(), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "md") != Some(true) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            if let Some(reference) = parse_reference(&path, &content) {
                refs.push(reference);
            }
        }

        // ISO dates sort correctly as strings
        refs.sort_by(|a, b| b.fetched_date.cmp(&a.fetched_date));
        Ok(refs)
    }

    /// Look up a reference by id, temporary directory first.
    pub async fn find(&self, ref_id: &str) -> Result<Reference, Error> {
        for dir in [&self.temp_dir, &self.permanent_dir] {
            if let Some(reference) = self.read_reference(dir, ref_id).await? {
                return Ok(reference);
            }
        }
        Err(Error::NotFound(ref_id.to_string()))
    }

    /// Look up a reference by exact source URL.
    pub async fn find_by_url(&self, url: &str) -> Result<Reference, Error> {
        let url = sanitize_url(url);
        for dir in [&self.temp_dir, &self.permanent_dir] {
            if let Some((reference, _)) = self.find_in_dir_by_url(dir, &url).await? {
                return Ok(reference);
            }
        }
        Err(Error::NotFound(url))
    }

    /// Move a reference from the temporary to the permanent directory,
    /// rewriting its status field.
    pub async fn promote(&self, ref_id: &str) -> Result<Promotion, Error> {
        let from = self.temp_dir.join(format!("{}.md", ref_id));
        let content = match fs::read_to_string(&from).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(ref_id.to_string()))
            }
            Err(e) => return Err(Error::io(from.display().to_string(), e)),
        };

        let Some(reference) = parse_reference(&from, &content) else {
            return Err(Error::NotFound(ref_id.to_string()));
        };

        fs::create_dir_all(&self.permanent_dir)
            .await
            .map_err(|e| Error::io(self.permanent_dir.display().to_string(), e))?;
        let to = self.permanent_dir.join(format!("{}.md", ref_id));

        // Write the promoted copy in full before touching the original, so
        // a crash in between leaves at worst a duplicate, never a loss.
        write_reference_with_date(
            &to,
            &reference.title,
            &reference.url,
            reference.query.as_deref(),
            RefStatus::Permanent,
            &reference.fetched_date,
            &reference.body,
        )
        .await?;

        fs::remove_file(&from)
            .await
            .map_err(|e| Error::io(from.display().to_string(), e))?;

        debug!(ref_id, "promoted reference");
        Ok(Promotion { from, to })
    }

    /// Remove a reference file, temporary directory first.
    pub async fn delete(&self, ref_id: &str) -> Result<PathBuf, Error> {
        for dir in [&self.temp_dir, &self.permanent_dir] {
            let path = dir.join(format!("{}.md", ref_id));
            match fs::remove_file(&path).await {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io(path.display().to_string(), e)),
            }
        }
        Err(Error::NotFound(ref_id.to_string()))
    }

    /// Extract inline `[text](href)` links from a reference body.
    ///
    /// Only http/https targets are kept, deduplicated by href with the
    /// first-seen text winning. The frontmatter header is excluded.
    pub async fn extract_links(&self, ref_id: &str) -> Result<Vec<ExtractedLink>, Error> {
        let reference = self.find(ref_id).await?;
        Ok(extract_links_from_body(&reference.body))
    }

    fn dir_for(&self, status: RefStatus) -> &Path {
        match status {
            RefStatus::Temporary => &self.temp_dir,
            RefStatus::Permanent => &self.permanent_dir,
        }
    }

    async fn read_reference(&self, dir: &Path, ref_id: &str) -> Result<Option<Reference>, Error> {
        let path = dir.join(format!("{}.md", ref_id));
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(parse_reference(&path, &content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path.display().to_string(), e)),
        }
    }

    async fn find_in_dir_by_url(
        &self,
        dir: &Path,
        url: &str,
    ) -> Result<Option<(Reference, PathBuf)>, Error> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(dir.display().to_string(), e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(dir.display().to_string(), e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "md") != Some(true) {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            if let Some(reference) = parse_reference(&path, &content) {
                if reference.url == url {
                    return Ok(Some((reference, path)));
                }
            }
        }
        Ok(None)
    }
}

/// Derive a filesystem- and id-safe slug from a title: lowercased,
/// non-alphanumeric runs collapsed to `-`, trimmed, capped at 60 chars.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug.truncate(60);
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}

/// Strip CR/LF so a hostile URL cannot smuggle extra header lines.
fn sanitize_url(url: &str) -> String {
    url.replace(['\r', '\n'], "")
}

/// Escape embedded quotes for the header's quoted-string fields. Other
/// characters pass through unescaped; this is not a full YAML encoder.
fn escape_quoted(value: &str) -> String {
    value.replace('"', "\\\"")
}

fn extract_links_from_body(body: &str) -> Vec<ExtractedLink> {
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for cap in INLINE_LINK_RE.captures_iter(body) {
        let href = cap[2].to_string();
        if seen.insert(href.clone()) {
            links.push(ExtractedLink {
                text: cap[1].to_string(),
                href,
            });
        }
    }
    links
}

fn parse_reference(path: &Path, content: &str) -> Option<Reference> {
    let (header_block, body) = split_frontmatter(content)?;
    let header = parse_header_block(header_block);

    let ref_id = path.file_stem()?.to_string_lossy().to_string();
    let status = match header.status.as_deref() {
        Some("permanent") => RefStatus::Permanent,
        _ => RefStatus::Temporary,
    };

    Some(Reference {
        ref_id,
        title: header.title?,
        url: header.source_url?,
        fetched_date: header.fetched_date?,
        query: header.query,
        status,
        body: body.to_string(),
    })
}

/// Split `---` fenced frontmatter from the body. Returns `None` when the
/// header block is absent or unterminated.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---\n")?;
    let end = rest.find("\n---")?;
    let header = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    let body = body.strip_prefix('\n').unwrap_or(body);
    Some((header, body))
}

async fn write_reference(
    path: &Path,
    title: &str,
    url: &str,
    query: Option<&str>,
    status: RefStatus,
    body: &str,
) -> Result<(), Error> {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    write_reference_with_date(path, title, url, query, status, &date, body).await
}

async fn write_reference_with_date(
    path: &Path,
    title: &str,
    url: &str,
    query: Option<&str>,
    status: RefStatus,
    date: &str,
    body: &str,
) -> Result<(), Error> {
    let mut content = String::new();
    content.push_str("---\n");
    content.push_str(&format!("title: \"{}\"\n", escape_quoted(title)));
    content.push_str(&format!("source_url: {}\n", sanitize_url(url)));
    content.push_str(&format!("fetched_date: {}\n", date));
    content.push_str("type: web\n");
    content.push_str(&format!("status: {}\n", status));
    if let Some(query) = query {
        content.push_str(&format!("query: \"{}\"\n", escape_quoted(query)));
    }
    content.push_str("---\n\n");
    content.push_str(body);

    // Complete-then-rename so readers never see a partial file.
    let tmp = path.with_extension("md.tmp");
    fs::write(&tmp, &content)
        .await
        .map_err(|e| Error::io(tmp.display().to_string(), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::io(path.display().to_string(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Rust Async — Getting Started"), "rust-async-getting-started");
        assert_eq!(slugify("  Hello,   World!  "), "hello-world");
        assert_eq!(slugify("UPPER lower 123"), "upper-lower-123");
        assert_eq!(slugify("???"), "untitled");

        let long = "word ".repeat(30);
        let slug = slugify(&long);
        assert!(slug.len() <= 60);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_split_frontmatter() {
        let content = "---\ntitle: \"T\"\nsource_url: https://a\nfetched_date: 2026-01-01\n---\n\nbody here\n\n---\n\nnot a header";
        let (header, body) = split_frontmatter(content).unwrap();
        assert!(header.contains("title"));
        assert!(body.starts_with("body here"));

        assert!(split_frontmatter("no header at all").is_none());
        assert!(split_frontmatter("---\nunterminated: yes\n").is_none());
    }

    #[test]
    fn test_extract_links_dedup_and_scheme_filter() {
        let body = "[A](https://x.com/p) [B](https://x.com/p) [C](mailto:y@z.com)";
        let links = extract_links_from_body(body);
        assert_eq!(
            links,
            vec![ExtractedLink {
                text: "A".to_string(),
                href: "https://x.com/p".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_save_dedups_by_url() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        let first = store
            .save("My Article", "https://example.com/a", "body one", None, false)
            .await
            .unwrap();
        assert!(!first.already_exists);
        assert_eq!(first.ref_id, "my-article");

        let second = store
            .save("Different Title", "https://example.com/a", "body two", None, false)
            .await
            .unwrap();
        assert!(second.already_exists);
        assert_eq!(second.ref_id, first.ref_id);
        assert_eq!(second.path, first.path);

        // No second file was created and the body is untouched
        let refs = store.list(RefStatus::Temporary).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].body.trim(), "body one");
    }

    #[tokio::test]
    async fn test_save_refetch_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        let first = store
            .save("My Article", "https://example.com/a", "old body", None, false)
            .await
            .unwrap();

        let again = store
            .save("Updated Title", "https://example.com/a", "new body", None, true)
            .await
            .unwrap();
        assert!(!again.already_exists);
        assert_eq!(again.ref_id, first.ref_id);
        assert_eq!(again.path, first.path);

        let found = store.find(&first.ref_id).await.unwrap();
        assert_eq!(found.title, "Updated Title");
        assert_eq!(found.body.trim(), "new body");
    }

    #[tokio::test]
    async fn test_list_sorts_by_date_desc_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());
        fs::create_dir_all(store.temp_dir()).await.unwrap();

        for (id, date) in [("older", "2026-01-02"), ("newest", "2026-03-01"), ("mid", "2026-02-10")] {
            let content = format!(
                "---\ntitle: \"{id}\"\nsource_url: https://example.com/{id}\nfetched_date: {date}\ntype: web\nstatus: temporary\n---\n\nbody\n"
            );
            fs::write(store.temp_dir().join(format!("{id}.md")), content)
                .await
                .unwrap();
        }
        fs::write(store.temp_dir().join("junk.md"), "no frontmatter here")
            .await
            .unwrap();
        fs::write(store.temp_dir().join("notes.txt"), "ignored extension")
            .await
            .unwrap();

        let refs = store.list(RefStatus::Temporary).await.unwrap();
        let ids: Vec<&str> = refs.iter().map(|r| r.ref_id.as_str()).collect();
        assert_eq!(ids, vec!["newest", "mid", "older"]);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path().join("nowhere"));
        assert!(store.list(RefStatus::Temporary).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promote_moves_and_rewrites_status() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        let saved = store
            .save("Keep Me", "https://example.com/keep", "body", Some("rust"), false)
            .await
            .unwrap();

        let promotion = store.promote(&saved.ref_id).await.unwrap();
        assert_eq!(promotion.from, saved.path);

        assert!(store.list(RefStatus::Temporary).await.unwrap().is_empty());
        let permanent = store.list(RefStatus::Permanent).await.unwrap();
        assert_eq!(permanent.len(), 1);
        assert_eq!(permanent[0].status, RefStatus::Permanent);
        assert_eq!(permanent[0].query.as_deref(), Some("rust"));

        // find still resolves after the move
        let found = store.find(&saved.ref_id).await.unwrap();
        assert_eq!(found.status, RefStatus::Permanent);

        // a second promote has nothing left to move
        let err = store.promote(&saved.ref_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        let saved = store
            .save("Gone Soon", "https://example.com/gone", "body", None, false)
            .await
            .unwrap();
        let path = store.delete(&saved.ref_id).await.unwrap();
        assert_eq!(path, saved.path);

        let err = store.delete(&saved.ref_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.find(&saved.ref_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_find_by_url() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        store
            .save("Some Page", "https://example.com/page", "body", None, false)
            .await
            .unwrap();

        let found = store.find_by_url("https://example.com/page").await.unwrap();
        assert_eq!(found.ref_id, "some-page");

        let err = store.find_by_url("https://example.com/other").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_header_injection_is_neutralized() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        let hostile_url = "https://example.com/a\nstatus: permanent";
        let saved = store
            .save("Tricky \"Quotes\"", hostile_url, "body", None, false)
            .await
            .unwrap();

        let found = store.find(&saved.ref_id).await.unwrap();
        assert_eq!(found.url, "https://example.com/astatus: permanent");
        assert_eq!(found.status, RefStatus::Temporary);
        assert_eq!(found.title, "Tricky \"Quotes\"");
    }

    #[tokio::test]
    async fn test_extract_links_via_store() {
        let dir = tempdir().unwrap();
        let store = ReferenceStore::open(dir.path());

        let body = "Intro [One](https://one.example) then [Two](https://two.example) \
                    and [One again](https://one.example).";
        let saved = store
            .save("Linky", "https://example.com/linky", body, None, false)
            .await
            .unwrap();

        let links = store.extract_links(&saved.ref_id).await.unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].text, "One");

        let err = store.extract_links("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
