use regex::Regex;
use url::Url;

use crate::job::{JobError, JobResult, OutputKind};

/// Canonical TLD every mirror domain is rewritten to before navigation.
const CANONICAL_TLD: &str = "fi";
const DOMAIN_FAMILY: &str = r"^(?P<sub>.*\.)?kukaj\.(?P<tld>[a-z]+)$";

/// Rewrites any host in the known mirror family (`kukaj.io`, `kukaj.in`,
/// `kukaj.tv`, ...) to the canonical `kukaj.fi` domain, preserving the
/// subdomain, path, query and fragment. Hosts outside the family are
/// rejected at admission.
pub fn normalize_target_url(raw: &str) -> JobResult<Url> {
    let parsed = Url::parse(raw).map_err(|err| JobError::UnsupportedDomain {
        host: format!("{raw} ({err})"),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| JobError::UnsupportedDomain {
            host: raw.to_string(),
        })?
        .to_ascii_lowercase();

    let family = Regex::new(DOMAIN_FAMILY).expect("domain family pattern is valid");
    let captures = family
        .captures(&host)
        .ok_or(JobError::UnsupportedDomain { host: host.clone() })?;

    let tld = &captures["tld"];
    if tld == CANONICAL_TLD {
        return Ok(parsed);
    }

    let subdomain = captures.name("sub").map(|m| m.as_str()).unwrap_or("");
    let canonical_host = format!("{subdomain}kukaj.{CANONICAL_TLD}");
    let mut normalized = parsed;
    normalized
        .set_host(Some(&canonical_host))
        .map_err(|_| JobError::UnsupportedDomain {
            host: canonical_host.clone(),
        })?;
    Ok(normalized)
}

/// Derives an output file name from the page path when the caller did not
/// supply one. Serial episodes keep the show prefix (`show/S01E01` becomes
/// `show_S01E01`); film pages use the last path segment alone.
pub fn suggest_output_name(url: &Url, kind: OutputKind) -> String {
    let segments: Vec<&str> = url
        .path()
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    let base = match segments.as_slice() {
        [] => "video".to_string(),
        [single] => (*single).to_string(),
        [.., parent, last] if *parent != "film" && *parent != "serial" => {
            format!("{parent}_{last}")
        }
        [.., last] => (*last).to_string(),
    };

    let sanitizer = Regex::new(r"[^\w\-_.]").expect("sanitizer pattern is valid");
    let clean = sanitizer.replace_all(&base, "_");
    format!("{clean}{ext}", ext = kind.extension())
}
