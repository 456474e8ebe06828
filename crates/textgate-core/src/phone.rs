//! Phone-number canonicalization and subject-line extraction.
//!
//! The canonical stored form is digits only: ten digits with a leading
//! digit of 2–9 for the US case, or eleven-plus digits for numbers that
//! arrive with a country code. Every equality check against a stored
//! contact phone goes through `canonicalize` first.

/// Reduce a human-formatted phone number to its canonical digit string.
///
/// Accepts any mix of spaces, dashes, dots, parentheses, and a leading
/// `+`. An eleven-digit number starting with `1` is folded to its
/// ten-digit national form. Returns `None` when fewer than ten digits
/// remain or a ten-digit result starts with 0 or 1.
pub fn canonicalize(raw: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }

    if digits.len() < 10 {
        return None;
    }
    if digits.len() == 10 && !digits.starts_with(|c| ('2'..='9').contains(&c)) {
        return None;
    }

    Some(digits)
}

/// Extract a destination number from an email subject line.
///
/// The subject is first reduced to its digits, then a ten-digit run with
/// a valid leading digit is accepted. Mirrors the canonical form above:
/// only ten-digit US-ish numbers qualify as a "text by number" subject.
pub fn extract_subject_number(subject: &str) -> Option<String> {
    let digits: String = subject.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    };

    if digits.len() != 10 {
        return None;
    }
    if !digits.starts_with(|c| ('2'..='9').contains(&c)) {
        return None;
    }

    Some(digits)
}

/// Whether the subject consists of nothing but a phone number (digits
/// plus common separators). Such emails are reserved for the SMS
/// dispatcher and never enter the command interpreter.
pub fn is_only_phone(subject: &str) -> bool {
    let stripped: String = subject
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')' | '+'))
        .collect();

    !stripped.is_empty()
        && stripped.chars().all(|c| c.is_ascii_digit())
        && extract_subject_number(subject).is_some()
}
