//! Merchant name normalization
//!
//! Pure token cleanup, no regular expressions: bank boilerplate is removed by
//! literal phrase/prefix matching and per-token checks.

/// Phrases card processors splice into descriptors
const BOILERPLATE_PHRASES: &[&str] = &[
    "- DEBIT",
    "- CREDIT",
    "- CHECKCARD",
    "DEBIT CARD PURCHASE",
    "DEBIT CARD",
    "CREDIT CARD",
    "CHECKCARD",
    "POS PURCHASE",
    "POS DEBIT",
    "RECURRING PAYMENT",
];

/// Aggregator prefixes in front of the real merchant
const PROCESSOR_PREFIXES: &[&str] = &["SQ *", "SQ*", "TST*", "TST *", "PP*", "PAYPAL *", "SP "];

const LEGAL_SUFFIXES: &[&str] = &["LLC", "INC", "CORP", "LTD", "CO", "CO.", "INC.", "L.L.C."];

const STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

/// Tokens that introduce a reference number (the token after them is dropped too)
const REFERENCE_MARKERS: &[&str] = &["REF", "REF#", "TXN", "ID:", "CONF#"];

/// Normalize a raw merchant string for cache lookups.
///
/// "SQ *BLUE BOTTLE COFFEE #123 OAKLAND CA" -> "BLUE BOTTLE COFFEE OAKLAND"
pub fn normalize_merchant(raw: &str) -> String {
    let mut text = raw.to_uppercase();

    for phrase in BOILERPLATE_PHRASES {
        text = text.replace(phrase, " ");
    }

    let trimmed = text.trim_start();
    for prefix in PROCESSOR_PREFIXES {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            text = rest.to_string();
            break;
        }
    }

    let text = text.replace('*', " ");
    let mut tokens: Vec<&str> = Vec::new();
    let mut skip_next = false;
    for token in text.split_whitespace() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if REFERENCE_MARKERS.contains(&token) {
            skip_next = true;
            continue;
        }
        if is_reference_token(token) {
            continue;
        }
        tokens.push(token);
    }

    // Trailing location and legal-entity noise, but never the whole name
    while tokens.len() > 1 {
        let last = tokens[tokens.len() - 1].trim_end_matches(',');
        if STATE_CODES.contains(&last) || LEGAL_SUFFIXES.contains(&last) {
            tokens.pop();
        } else {
            break;
        }
    }

    tokens
        .iter()
        .map(|t| t.trim_end_matches(','))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Store numbers ("#4521"), long digit runs and digit-heavy reference codes
fn is_reference_token(token: &str) -> bool {
    if token.starts_with('#') {
        return true;
    }
    let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
    let len = token.chars().count();
    (digits >= 4 && digits == len) || (len >= 6 && digits * 2 > len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_store_numbers() {
        assert_eq!(normalize_merchant("STARBUCKS #4521"), "STARBUCKS");
        assert_eq!(normalize_merchant("Whole Foods Market #12"), "WHOLE FOODS MARKET");
    }

    #[test]
    fn test_strips_boilerplate_and_prefixes() {
        assert_eq!(normalize_merchant("CHECKCARD 0412 SHELL OIL 5744"), "SHELL OIL");
        assert_eq!(normalize_merchant("SQ *BLUE BOTTLE COFFEE"), "BLUE BOTTLE COFFEE");
        assert_eq!(normalize_merchant("TST* DIG INN"), "DIG INN");
        assert_eq!(normalize_merchant("NETFLIX.COM - DEBIT"), "NETFLIX.COM");
    }

    #[test]
    fn test_strips_trailing_state_and_suffix() {
        assert_eq!(normalize_merchant("ACME WIDGETS LLC"), "ACME WIDGETS");
        assert_eq!(normalize_merchant("SHELL OIL SEATTLE WA"), "SHELL OIL SEATTLE");
        assert_eq!(normalize_merchant("PEETS COFFEE, INC."), "PEETS COFFEE");
    }

    #[test]
    fn test_never_empties_a_name() {
        assert_eq!(normalize_merchant("CO"), "CO");
        assert_eq!(normalize_merchant("  target  "), "TARGET");
    }

    #[test]
    fn test_drops_reference_numbers() {
        assert_eq!(normalize_merchant("AMAZON MKTP REF 8H2KQ1"), "AMAZON MKTP");
        assert_eq!(normalize_merchant("UBER TRIP 7X9Q2231"), "UBER TRIP");
    }
}
