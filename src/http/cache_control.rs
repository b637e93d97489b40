//! Relaxed, streaming-style `Cache-Control` parser.
//!
//! The client derives a single max-age figure from the header. Tokens are
//! matched case-insensitively and unknown tokens are skipped. When several
//! directives compete, the strictest interpretation wins:
//!
//! `private` > `no-cache` > `must-revalidate` > `s-maxage=N` > `max-age=N`
//!
//! `private` and `no-cache` both collapse to a max-age of zero,
//! `must-revalidate` to the [`MUST_REVALIDATE`] sentinel. `public` on its own
//! says nothing about lifetime and is ignored.

use crate::http::types::MUST_REVALIDATE;

/// Derives max-age seconds from a `Cache-Control` value.
///
/// Returns `None` when the header carries no usable lifetime directive.
pub fn parse_cache_control(value: &str) -> Option<i64> {
    let mut private = false;
    let mut no_cache = false;
    let mut must_revalidate = false;
    let mut s_maxage: Option<i64> = None;
    let mut max_age: Option<i64> = None;

    for token in value.split(',') {
        let token = token.trim();
        let (name, arg) = match token.split_once('=') {
            Some((n, a)) => (n.trim(), Some(a.trim())),
            None => (token, None),
        };

        if name.eq_ignore_ascii_case("private") {
            private = true;
        } else if name.eq_ignore_ascii_case("no-cache") {
            no_cache = true;
        } else if name.eq_ignore_ascii_case("must-revalidate") {
            must_revalidate = true;
        } else if name.eq_ignore_ascii_case("s-maxage") {
            s_maxage = parse_age(arg).or(s_maxage);
        } else if name.eq_ignore_ascii_case("max-age") {
            max_age = parse_age(arg).or(max_age);
        }
    }

    if private || no_cache {
        Some(0)
    } else if must_revalidate {
        Some(MUST_REVALIDATE)
    } else if s_maxage.is_some() {
        s_maxage
    } else {
        max_age
    }
}

fn parse_age(arg: Option<&str>) -> Option<i64> {
    let n = arg?.trim_matches('"').parse::<i64>().ok()?;
    (n >= 0).then_some(n)
}
