use std::time::{SystemTime, UNIX_EPOCH};

use janus::http::date::{format_http_date, parse_http_date};

#[test]
fn test_format_known_timestamp() {
    assert_eq!(
        format_http_date(1_700_000_000),
        "Tue, 14 Nov 2023 22:13:20 GMT"
    );
}

#[test]
fn test_format_epoch_zero() {
    assert_eq!(format_http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
}

#[test]
fn test_round_trip() {
    for t in [0i64, 1, 86_400, 1_000_000_000, 1_700_000_000, 4_102_444_800] {
        let formatted = format_http_date(t);
        assert_eq!(parse_http_date(&formatted), Some(t), "t = {}", t);
    }
}

#[test]
fn test_negative_means_now() {
    let formatted = format_http_date(-1);
    let parsed = parse_http_date(&formatted).expect("format of 'now' must parse");

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    assert!((now - parsed).abs() <= 5, "now={} parsed={}", now, parsed);
}

#[test]
fn test_parse_rejects_garbage() {
    assert_eq!(parse_http_date("yesterday-ish"), None);
    assert_eq!(parse_http_date(""), None);
}

#[test]
fn test_parse_tolerates_surrounding_whitespace() {
    assert_eq!(
        parse_http_date(" Tue, 14 Nov 2023 22:13:20 GMT "),
        Some(1_700_000_000)
    );
}
