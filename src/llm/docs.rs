// =============================================================================
// Registry documentation loader — docs/indicator-registry.md
// =============================================================================
//
// The documentation file is human-maintained markdown. Indicator blocks are
// keyed by backticked ids; the series glossary section additionally yields
// structured what/impact/interpretation fields. Parses are cached by file
// mtime.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;

/// Default documentation location relative to the working directory.
pub const DOCS_PATH: &str = "docs/indicator-registry.md";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SeriesDoc {
    pub title: String,
    pub what: String,
    pub impact: String,
    pub interpretation: String,
}

#[derive(Debug, Default)]
pub struct ParsedDocs {
    /// Full markdown block per backticked id (indicators and series alike).
    pub blocks: HashMap<String, String>,
    /// Structured glossary entries for series ids.
    pub series: HashMap<String, SeriesDoc>,
}

fn item_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-\s*`([^`]+)`\s+—\s+(.*)$").expect("valid regex"))
}

fn field_pattern(field: &str) -> Regex {
    Regex::new(&format!(r"\*\*{field}[^:*]*\*\*:\s*(.*)")).expect("valid regex")
}

/// Parse the documentation markdown. Pure; used directly by tests.
pub fn parse_docs(text: &str) -> ParsedDocs {
    let pat = item_pattern();

    // Pass 1: full blocks per id.
    let mut blocks: HashMap<String, Vec<&str>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        if let Some(caps) = pat.captures(line) {
            let id = caps[1].trim().to_string();
            blocks.entry(id.clone()).or_default();
            current = Some(id);
            continue;
        }
        if let Some(id) = &current {
            blocks.get_mut(id).expect("block exists").push(line);
        }
    }
    let blocks: HashMap<String, String> = blocks
        .into_iter()
        .map(|(id, lines)| (id, lines.join("\n").trim().to_string()))
        .collect();

    // Pass 2: structured series glossary.
    let what_re = field_pattern("What it is");
    let impact_re = field_pattern("Impact");
    let interp_re = field_pattern("Interpretation");

    let mut series: HashMap<String, SeriesDoc> = HashMap::new();
    let mut in_series = false;
    let mut current: Option<(String, String, Vec<&str>)> = None;

    let flush = |entry: Option<(String, String, Vec<&str>)>,
                 series: &mut HashMap<String, SeriesDoc>| {
        let Some((id, title, lines)) = entry else { return };
        let content = lines.join("\n");
        let grab = |re: &Regex| {
            re.captures(&content)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default()
        };
        series.insert(
            id,
            SeriesDoc {
                title,
                what: grab(&what_re),
                impact: grab(&impact_re),
                interpretation: grab(&interp_re),
            },
        );
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("## Series glossary") {
            in_series = true;
            current = None;
            continue;
        }
        if trimmed.starts_with("## Indicators") {
            flush(current.take(), &mut series);
            in_series = false;
            continue;
        }
        if !in_series {
            continue;
        }
        if let Some(caps) = pat.captures(line) {
            flush(current.take(), &mut series);
            current = Some((caps[1].trim().to_string(), caps[2].trim().to_string(), Vec::new()));
        } else if let Some((_, _, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    flush(current.take(), &mut series);

    ParsedDocs { blocks, series }
}

// =============================================================================
// mtime-cached file access
// =============================================================================

type DocsCache = Mutex<HashMap<PathBuf, (SystemTime, Arc<ParsedDocs>)>>;

fn cache() -> &'static DocsCache {
    static CACHE: OnceLock<DocsCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn load(path: &Path) -> Arc<ParsedDocs> {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let Some(mtime) = mtime else {
        return Arc::new(ParsedDocs::default());
    };

    let mut cached = cache().lock();
    if let Some((stored_mtime, parsed)) = cached.get(path) {
        if *stored_mtime == mtime {
            return parsed.clone();
        }
    }
    let parsed = Arc::new(
        std::fs::read_to_string(path)
            .map(|text| parse_docs(&text))
            .unwrap_or_default(),
    );
    cached.insert(path.to_path_buf(), (mtime, parsed.clone()));
    parsed
}

/// Full markdown block for an indicator id; empty string when missing.
pub fn get_indicator_doc(path: &Path, indicator_id: &str) -> String {
    load(path).blocks.get(indicator_id).cloned().unwrap_or_default()
}

/// Structured glossary entry for a series id; empty object when missing.
pub fn get_series_doc(path: &Path, series_id: &str) -> serde_json::Value {
    match load(path).series.get(series_id) {
        Some(doc) => serde_json::to_value(doc).unwrap_or_else(|_| serde_json::json!({})),
        None => serde_json::json!({}),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Indicator registry

## Series glossary (raw inputs)

- `TGA` — Treasury General Account
  **What it is**: Treasury's checking account at the Fed.
  **Impact**: Rebuilds drain reserves.
  **Interpretation (rule of thumb)**: Rising TGA is draining.

- `WALCL` — Fed total assets
  **What it is**: Total Fed balance sheet.
  **Impact**: The top line of system liquidity.

## Indicators

- `net_liq` — Net liquidity
  WALCL minus TGA minus RRP, z-scored weekly.

- `qt_pace` — QT runoff vs caps
  Weekly runoff compared against the published caps.
";

    #[test]
    fn indicator_blocks_are_extracted() {
        let docs = parse_docs(SAMPLE);
        let block = docs.blocks.get("net_liq").unwrap();
        assert!(block.contains("WALCL minus TGA minus RRP"));
        assert!(docs.blocks.contains_key("qt_pace"));
    }

    #[test]
    fn series_glossary_yields_structured_fields() {
        let docs = parse_docs(SAMPLE);
        let tga = docs.series.get("TGA").unwrap();
        assert_eq!(tga.title, "Treasury General Account");
        assert_eq!(tga.what, "Treasury's checking account at the Fed.");
        assert_eq!(tga.impact, "Rebuilds drain reserves.");
        assert_eq!(tga.interpretation, "Rising TGA is draining.");

        // Missing fields stay empty rather than erroring.
        let walcl = docs.series.get("WALCL").unwrap();
        assert!(walcl.interpretation.is_empty());
        // Indicators are not glossary entries.
        assert!(!docs.series.contains_key("net_liq"));
    }

    #[test]
    fn missing_file_yields_empty_docs() {
        assert_eq!(get_indicator_doc(Path::new("/nonexistent/docs.md"), "net_liq"), "");
        assert_eq!(
            get_series_doc(Path::new("/nonexistent/docs.md"), "TGA"),
            serde_json::json!({})
        );
    }

    #[test]
    fn unknown_ids_yield_empty_values() {
        let docs = parse_docs(SAMPLE);
        assert!(docs.blocks.get("nope").is_none());
        assert!(docs.series.get("nope").is_none());
    }
}
