use crate::models::PriceField;
use once_cell::sync::Lazy;
use regex::Regex;

/// Parses a price as suppliers write it: `15000`, `"R$ 1.234,56"`, `"1,234.56"`.
///
/// Returns `None` for anything that is not a finite number.
pub fn parse_price(field: &PriceField) -> Option<f64> {
    match field {
        PriceField::Amount(value) => value.is_finite().then_some(*value),
        PriceField::Text(raw) => parse_price_text(raw),
    }
}

/// One numeric token with an optional sign and currency marker on either side.
/// Installments, ranges and pack annotations carry extra text and never match.
static PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^([+-])?\s*(?:r\$|us\$|\$|€|brl|usd|eur)?\s*([+-])?\s*(\d(?:[\d.,]*\d)?)\s*(?:r\$|us\$|\$|€|brl|usd|eur|reais)?$",
    )
    .expect("price pattern compiles")
});

pub fn parse_price_text(raw: &str) -> Option<f64> {
    let caps = PRICE_RE.captures(raw.trim())?;
    let negative = match (caps.get(1), caps.get(2)) {
        (Some(_), Some(_)) => return None,
        (Some(sign), None) | (None, Some(sign)) => sign.as_str() == "-",
        (None, None) => false,
    };
    let body = caps.get(3)?.as_str();

    let normalized = match (body.rfind(','), body.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => body.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => body.replace(',', ""),
        (Some(_), None) => {
            if is_decimal_separator(body, ',') {
                body.replace(',', ".")
            } else {
                body.replace(',', "")
            }
        }
        (None, Some(_)) => {
            if is_decimal_separator(body, '.') {
                body.to_string()
            } else {
                body.replace('.', "")
            }
        }
        (None, None) => body.to_string(),
    };

    let value: f64 = normalized.parse().ok()?;
    let value = if negative { -value } else { value };
    value.is_finite().then_some(value)
}

/// A lone separator followed by one or two digits is a decimal mark.
/// Three trailing digits (`15.000`, `1,500`) read as thousands grouping.
fn is_decimal_separator(body: &str, separator: char) -> bool {
    if body.matches(separator).count() != 1 {
        return false;
    }
    let fraction = body.rsplit(separator).next().unwrap_or("");
    (1..=2).contains(&fraction.len())
}

pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_catalog_formats() {
        assert_eq!(parse_price_text("15000"), Some(15000.0));
        assert_eq!(parse_price_text("R$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_price_text("1,234.56"), Some(1234.56));
        assert_eq!(parse_price_text("89,9"), Some(89.9));
        assert_eq!(parse_price_text("15.000"), Some(15000.0));
        assert_eq!(parse_price_text("12.50"), Some(12.5));
        assert_eq!(parse_price_text("999,999,999,999"), Some(999_999_999_999.0));
        assert_eq!(parse_price_text("-5"), Some(-5.0));
        assert_eq!(parse_price_text("R$ -5,00"), Some(-5.0));
        assert_eq!(parse_price_text("-R$ 5,00"), Some(-5.0));
        assert_eq!(parse_price_text("34,90 reais"), Some(34.9));
        assert_eq!(parse_price_text("USD 12.50"), Some(12.5));
    }

    #[test]
    fn rejects_non_numbers() {
        assert_eq!(parse_price_text("consulte"), None);
        assert_eq!(parse_price_text(""), None);
        assert_eq!(parse_price_text(",."), None);
        assert_eq!(parse_price_text("- R$ -5"), None);
        assert_eq!(parse_price_text("15,"), None);
        assert_eq!(parse_price(&PriceField::Amount(f64::NAN)), None);
        assert_eq!(parse_price(&PriceField::Amount(f64::INFINITY)), None);
    }

    #[test]
    fn extra_text_around_the_number_is_not_a_price() {
        assert_eq!(parse_price_text("12x de R$ 34,90"), None);
        assert_eq!(parse_price_text("10 - 20"), None);
        assert_eq!(parse_price_text("R$ 15,00 / un (cx 12)"), None);
        assert_eq!(parse_price_text("a partir de 89,90"), None);
        assert_eq!(parse_price_text("R$ 34,90 à vista"), None);
    }
}
