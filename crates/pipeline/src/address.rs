use std::sync::LazyLock;

use regex::Regex;

/// One parsed shipment, one per blank-line-separated block of input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub full_name: String,
    pub address_line_1: String,
    pub address_line_2: String,
    pub town_city: String,
    pub county: String,
    pub postcode: String,
    pub country: String,
    pub service: String,
    pub weight_kg: f64,
    pub reference: String,
    pub notes: String,
    pub needs_review: bool,
}

static POSTCODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(GIR\s?0AA|[A-Z]{1,2}\d[A-Z\d]?\s*\d[A-Z]{2})\b").unwrap()
});

static POSTCODE_COMPACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{1,2}\d[A-Z\d]?\d[A-Z]{2}$").unwrap());

// Control characters, zero-width marks, and emoji.
static NOISE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{C}\p{So}]").unwrap());

static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static CHUNK_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n+").unwrap());

const EDGE_TRIM: &[char] = &[' ', '\n', '\r', '\t', ',', '.'];

// Punctuation is stripped before the comparison, so dotted forms like
// "U.K." match through the plain variant.
const UK_COUNTRY_VARIANTS: [&str; 9] = [
    "UK",
    "UNITED KINGDOM",
    "GREAT BRITAIN",
    "GB",
    "BRITAIN",
    "ENGLAND",
    "SCOTLAND",
    "WALES",
    "NORTHERN IRELAND",
];

const ACRONYMS: [&str; 5] = ["PO", "UK", "GB", "EU", "USA"];

/// Reduce a pasted line to plain text: control characters, zero-width marks,
/// and emoji go away, whitespace runs collapse to one space, and stray
/// punctuation at either end is dropped.
pub fn clean_line(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let text = NOISE.replace_all(s, "");
    let text = SPACES.replace_all(&text, " ");
    text.trim_matches(EDGE_TRIM).to_string()
}

/// Whether the input looks like a UK postcode once spacing and punctuation
/// are ignored.
pub fn is_probably_uk_postcode(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let compact = compact_alnum(s);
    compact == "GIR0AA" || POSTCODE_COMPACT.is_match(&compact)
}

/// Uppercase a UK postcode with the single space before the inward code.
/// Returns an empty string for anything that does not look like one.
pub fn normalize_uk_postcode(s: &str) -> String {
    let compact = compact_alnum(s);
    if !is_probably_uk_postcode(&compact) {
        return String::new();
    }
    if compact == "GIR0AA" {
        return "GIR 0AA".to_string();
    }
    let split = compact.len() - 3;
    format!("{} {}", &compact[..split], &compact[split..])
}

fn compact_alnum(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn title_case_token(token: &str) -> String {
    if token.is_empty() {
        return String::new();
    }
    let upper = token.to_uppercase();
    if ACRONYMS.contains(&upper.as_str()) {
        return upper;
    }
    if token.chars().count() <= 2 && token.chars().all(char::is_alphabetic) {
        return upper;
    }
    if token.chars().any(|c| c.is_ascii_digit()) {
        return upper;
    }
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

// Title-case-ish normalization that leaves acronyms, initials, and
// house numbers alone.
fn normalize_case(text: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        if raw.contains('-') {
            tokens.push(
                raw.split('-')
                    .map(title_case_token)
                    .collect::<Vec<_>>()
                    .join("-"),
            );
        } else if raw.contains('\'') {
            tokens.push(
                raw.split('\'')
                    .map(title_case_token)
                    .collect::<Vec<_>>()
                    .join("'"),
            );
        } else {
            tokens.push(title_case_token(raw));
        }
    }
    tokens.join(" ")
}

fn split_on_commas(line: &str) -> Vec<String> {
    line.split(',')
        .map(clean_line)
        .filter(|part| !part.is_empty())
        .collect()
}

fn extract_postcode(line: &str) -> (String, String) {
    let Some(captures) = POSTCODE.captures(line) else {
        return (line.to_string(), String::new());
    };
    let normalized = captures
        .get(1)
        .map(|m| normalize_uk_postcode(m.as_str()))
        .unwrap_or_default();
    let remaining = clean_line(&POSTCODE.replace_all(line, " "));
    (remaining, normalized)
}

fn is_country_line(line: &str) -> bool {
    let cleaned: String = line
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || c.is_whitespace())
        .collect();
    let cleaned = cleaned.trim().to_uppercase();
    UK_COUNTRY_VARIANTS.contains(&cleaned.as_str())
}

// Positional assignment. Extra middle lines fold into address_line_2 so
// nothing is dropped.
fn assign_address_fields(lines: &[String]) -> (String, String, String, String) {
    match lines {
        [] => (String::new(), String::new(), String::new(), String::new()),
        [a1] => (a1.clone(), String::new(), String::new(), String::new()),
        [a1, town] => (a1.clone(), String::new(), town.clone(), String::new()),
        [a1, a2, town] => (a1.clone(), a2.clone(), town.clone(), String::new()),
        [a1, a2, middle @ .., town, county] => {
            let mut second = a2.clone();
            if !middle.is_empty() {
                let mut parts = vec![second];
                parts.extend(middle.iter().cloned());
                second = parts.join(", ");
            }
            (a1.clone(), second, town.clone(), county.clone())
        }
    }
}

pub(crate) fn split_chunks(raw_text: &str) -> Vec<&str> {
    CHUNK_BREAK
        .split(raw_text.trim())
        .filter(|chunk| !chunk.trim().is_empty())
        .collect()
}

/// Parse blank-line-separated address blocks into records.
///
/// The first line of each block is the recipient name. Remaining lines are
/// split on commas; country parts are dropped, postcode parts are extracted
/// wherever they appear, and what is left is assigned to the address fields
/// by position.
pub fn parse_batch(raw_text: &str) -> Vec<Record> {
    if raw_text.is_empty() {
        return Vec::new();
    }

    let mut records = Vec::new();
    for chunk in split_chunks(raw_text) {
        let lines: Vec<String> = chunk
            .lines()
            .map(clean_line)
            .filter(|line| !line.is_empty())
            .collect();
        let Some((first, rest)) = lines.split_first() else {
            continue;
        };

        let full_name = normalize_case(first);
        let mut postcode = String::new();
        let mut processed: Vec<String> = Vec::new();
        for raw_line in rest {
            for part in split_on_commas(raw_line) {
                if is_country_line(&part) {
                    continue;
                }
                let (remaining, extracted) = extract_postcode(&part);
                if !extracted.is_empty() {
                    postcode = extracted;
                }
                if !remaining.is_empty() {
                    processed.push(normalize_case(&remaining));
                }
            }
        }

        let (address_line_1, address_line_2, town_city, county) =
            assign_address_fields(&processed);
        records.push(Record {
            full_name,
            address_line_1,
            address_line_2,
            town_city,
            county,
            postcode,
            country: "UNITED KINGDOM".to_string(),
            ..Record::default()
        });
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_line_strips_noise() {
        assert_eq!(
            clean_line("  Flat 2,  10 High Street.  "),
            "Flat 2, 10 High Street"
        );
        assert_eq!(clean_line("10 Downing St \u{1F3E0}"), "10 Downing St");
        assert_eq!(clean_line("Jo\u{200B}hn"), "John");
        assert_eq!(clean_line(""), "");
    }

    #[test]
    fn postcode_detection() {
        assert!(is_probably_uk_postcode("SA198PQ"));
        assert!(is_probably_uk_postcode("sa19 8pq"));
        assert!(is_probably_uk_postcode("GIR 0AA"));
        assert!(is_probably_uk_postcode("BR5 4AR"));
        assert!(!is_probably_uk_postcode("12345"));
        assert!(!is_probably_uk_postcode("SW1A"));
        assert!(!is_probably_uk_postcode(""));
    }

    #[test]
    fn postcode_normalization() {
        assert_eq!(normalize_uk_postcode("AB538HY"), "AB53 8HY");
        assert_eq!(normalize_uk_postcode("sa198pq"), "SA19 8PQ");
        assert_eq!(normalize_uk_postcode("ME74NN"), "ME7 4NN");
        assert_eq!(normalize_uk_postcode("CF644BU"), "CF64 4BU");
        assert_eq!(normalize_uk_postcode("BR5 4AR"), "BR5 4AR");
        assert_eq!(normalize_uk_postcode("GIR0AA"), "GIR 0AA");
        assert_eq!(normalize_uk_postcode("not a postcode"), "");
    }

    #[test]
    fn case_normalization_keeps_acronyms_and_initials() {
        assert_eq!(normalize_case("grace o'neil"), "Grace O'Neil");
        assert_eq!(normalize_case("po box 12"), "PO Box 12");
        assert_eq!(normalize_case("IAIN FRENCH"), "Iain French");
        assert_eq!(normalize_case("m taylor"), "M Taylor");
        assert_eq!(normalize_case("flat 2b dock road"), "Flat 2B Dock Road");
    }

    #[test]
    fn parse_batch_assigns_fields_by_position() {
        let text = "Grace O'Neil\nFlat 2, 10 High Street\nStonehaven\nAberdeenshire\nAB538HY\nUK";
        let records = parse_batch(text);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.full_name, "Grace O'Neil");
        assert_eq!(record.address_line_1, "Flat 2");
        assert_eq!(record.address_line_2, "10 High Street");
        assert_eq!(record.town_city, "Stonehaven");
        assert_eq!(record.county, "Aberdeenshire");
        assert_eq!(record.postcode, "AB53 8HY");
        assert_eq!(record.country, "UNITED KINGDOM");
    }

    #[test]
    fn parse_batch_single_address_line() {
        let text = "James Hannay\nPO Box 12\nSa198pq\nWales";
        let records = parse_batch(text);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.full_name, "James Hannay");
        assert_eq!(record.address_line_1, "PO Box 12");
        assert_eq!(record.address_line_2, "");
        assert_eq!(record.town_city, "");
        assert_eq!(record.county, "");
        assert_eq!(record.postcode, "SA19 8PQ");
        assert_eq!(record.country, "UNITED KINGDOM");
    }

    #[test]
    fn parse_batch_folds_middle_lines_into_line_two() {
        let text = "Martin Wilkie\nUnit 7\nRiverside Estate\nDock Road\nBarry\nGlamorgan\nCF644BU";
        let record = &parse_batch(text)[0];
        assert_eq!(record.address_line_1, "Unit 7");
        assert_eq!(record.address_line_2, "Riverside Estate, Dock Road");
        assert_eq!(record.town_city, "Barry");
        assert_eq!(record.county, "Glamorgan");
        assert_eq!(record.postcode, "CF64 4BU");
    }

    #[test]
    fn parse_batch_splits_chunks_on_blank_lines() {
        let text = "Grace O'Neil\nFlat 2\nAB53 8HY\n\n\nMartin Wilkie\nDock Road\nCF64 4BU";
        let records = parse_batch(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].full_name, "Grace O'Neil");
        assert_eq!(records[1].full_name, "Martin Wilkie");
    }

    #[test]
    fn parse_batch_empty_input() {
        assert!(parse_batch("").is_empty());
        assert!(parse_batch("\n\n  \n").is_empty());
    }
}
