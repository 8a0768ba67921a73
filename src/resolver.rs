//! Resolution of BaseURL chains and expansion of SegmentTemplate placeholders.

use crate::DashDemuxError;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;
use url::Url;


pub(crate) fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") ||
        s.starts_with("https://") ||
        s.starts_with("file://") ||
        s.starts_with("crypto+")
}

fn parse_error(why: &str, e: impl std::error::Error) -> DashDemuxError {
    DashDemuxError::Parsing(format!("{why}: {e:#?}"))
}

/// Resolve a BaseURL element against the accumulated base of its enclosing scopes. An absolute
/// URL resets the chain; a relative one is joined using standard URL rules, so that an empty
/// BaseURL inherits the directory of the enclosing document URL.
pub fn merge_baseurls(current: &Url, new: &str) -> Result<Url, DashDemuxError> {
    if is_absolute_url(new) {
        Url::parse(new)
            .map_err(|e| parse_error("parsing BaseURL", e))
    } else {
        // some origins carry a session token in the query string, so joining must not drop it
        let mut merged = current.join(new)
            .map_err(|e| parse_error("joining base with BaseURL", e))?;
        merged.set_query(current.query());
        Ok(merged)
    }
}

/// Parse a byte-range specifier, such as the Initialization@range or SegmentURL@mediaRange
/// attributes, of the form "45-67".
pub fn parse_range(range: &str) -> Result<(u64, u64), DashDemuxError> {
    let v: Vec<&str> = range.split_terminator('-').collect();
    if v.len() != 2 {
        return Err(DashDemuxError::Parsing(format!("invalid range specifier: {range}")));
    }
    let start: u64 = v[0].parse()
        .map_err(|_| DashDemuxError::Parsing(String::from("invalid start for range specifier")))?;
    let end: u64 = v[1].parse()
        .map_err(|_| DashDemuxError::Parsing(String::from("invalid end for range specifier")))?;
    Ok((start, end))
}


// The only format tag DASH-IF permits inside a placeholder is %0<width>d, so zero-padded
// decimal formatting covers every legal template; no printf emulation is needed.
lazy_static! {
    // one placeholder span: "$$", or $Identifier$ with an optional %0<width>d padding tag
    static ref TEMPLATE_SPAN: Regex =
        Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)?(?:%0(\d+)d)?\$").unwrap();
}

/// Substitute the DASH template placeholders (`$RepresentationID$`, `$Bandwidth$`, `$Number$`,
/// `$Time$`, optionally carrying a `%0Nd` zero-padding width) in a SegmentTemplate string. A
/// literal `$$` is an escaped `$`. Placeholders with no value in `params` are left as they are.
pub fn resolve_url_template(template: &str, params: &HashMap<&str, String>) -> String {
    TEMPLATE_SPAN.replace_all(template, |caps: &Captures| {
        if &caps[0] == "$$" {
            return String::from("$");
        }
        let Some(ident) = caps.get(1) else {
            return caps[0].to_string();
        };
        match params.get(ident.as_str()) {
            Some(value) => {
                let width = caps.get(2)
                    .and_then(|w| w.as_str().parse::<usize>().ok())
                    .unwrap_or(0);
                format!("{value:0>width$}")
            },
            None => caps[0].to_string(),
        }
    }).into_owned()
}
