use std::sync::LazyLock;

use dropline_config::{ClientDefaults, ServiceRule, Trigger};
use regex::Regex;

use crate::address::{Record, parse_batch, split_chunks};

static SERVICE_OVERRIDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSERVICE\s*=\s*(\w+)\b").unwrap());

/// Match a block of raw text against the client's service rules.
///
/// An explicit `SERVICE=<tag>` override wins when it names a configured tag.
/// Otherwise each tag is searched for as a standalone word or in square
/// brackets, case-insensitively, in rule order. Returns the service name and
/// the tag that matched.
pub fn find_service_tag(chunk: &str, services: &[ServiceRule]) -> Option<(String, String)> {
    if let Some(captures) = SERVICE_OVERRIDE.captures(chunk) {
        if let Some(wanted) = captures.get(1) {
            let wanted = wanted.as_str().trim().to_uppercase();
            for service in services {
                if let Trigger::Tag { tag } = &service.trigger {
                    if tag.to_uppercase() == wanted {
                        return Some((service.name.clone(), tag.clone()));
                    }
                }
            }
        }
    }

    for service in services {
        let Trigger::Tag { tag } = &service.trigger else {
            continue;
        };
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        let escaped = regex::escape(tag);
        for pattern in [
            format!(r"(?i)\b{escaped}\b"),
            format!(r"(?i)\[{escaped}\]"),
        ] {
            if let Ok(re) = Regex::new(&pattern) {
                if re.is_match(chunk) {
                    return Some((service.name.clone(), tag.to_string()));
                }
            }
        }
    }

    None
}

/// The name of the client's default-trigger service, or `fallback` when no
/// rule declares one.
pub fn default_service(services: &[ServiceRule], fallback: &str) -> String {
    services
        .iter()
        .find(|service| matches!(service.trigger, Trigger::Default))
        .map(|service| service.name.clone())
        .unwrap_or_else(|| fallback.to_string())
}

/// Parse raw input into records, one per block, with the matched or default
/// service and the client's default weight applied.
pub fn parse_records(
    raw_text: &str,
    services: &[ServiceRule],
    defaults: &ClientDefaults,
) -> Vec<Record> {
    if raw_text.trim().is_empty() {
        return Vec::new();
    }

    let fallback = default_service(services, &defaults.service);
    let mut records = Vec::new();
    for chunk in split_chunks(raw_text) {
        let Some(mut record) = parse_batch(chunk).into_iter().next() else {
            continue;
        };
        let matched = find_service_tag(chunk, services);
        record.service = match &matched {
            Some((name, _)) => name.clone(),
            None => fallback.clone(),
        };
        record.weight_kg = defaults.weight_kg;
        if let Some((_, tag)) = matched {
            let note = format!("Tag matched: {tag}");
            record.notes = if record.notes.trim().is_empty() {
                note
            } else {
                format!("{} {note}", record.notes.trim())
            };
        }
        records.push(record);
    }
    records
}
