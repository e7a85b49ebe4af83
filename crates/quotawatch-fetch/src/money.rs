//! Money values as the dashboards print them: `¥149.64`, `"1,234.5"`, or
//! plain JSON numbers.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static MONEY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[-+]?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?").ok());

/// Parse a money value. Returns `None` for nulls, objects and strings
/// without a number in them.
pub fn parse_money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_money_str(s),
        _ => None,
    }
}

/// Parse the first number in `s`, ignoring currency symbols and
/// thousands separators.
pub fn parse_money_str(s: &str) -> Option<f64> {
    let re = MONEY.as_ref()?;
    let m = re.find(s)?;
    m.as_str().replace(',', "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn currency_prefix() {
        assert_eq!(parse_money(&json!("¥149.64")), Some(149.64));
    }

    #[test]
    fn thousands_separator() {
        assert_eq!(parse_money(&json!("1,234.5")), Some(1234.5));
        assert_eq!(parse_money_str("¥12,000"), Some(12000.0));
    }

    #[test]
    fn json_numbers() {
        assert_eq!(parse_money(&json!(42)), Some(42.0));
        assert_eq!(parse_money(&json!(0.48)), Some(0.48));
    }

    #[test]
    fn no_number() {
        assert_eq!(parse_money(&json!("n/a")), None);
        assert_eq!(parse_money(&json!(null)), None);
        assert_eq!(parse_money(&json!({"v": 1})), None);
    }

    #[test]
    fn negative_value() {
        assert_eq!(parse_money_str("-3.5 CNY"), Some(-3.5));
    }
}
