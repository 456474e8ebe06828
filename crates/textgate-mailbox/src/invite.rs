//! Invitation-email parsing.
//!
//! An invitation arrives with the subject `"... Person in Custody:
//! LastName, FirstName"` and a body line `"Identification Code: XXXX"`.
//! The code goes into the portal's pending-contact page; the name is
//! reordered to `"FirstName LastName"` for the welcome flow.

use mailparse::MailHeaderMap;
use tracing::warn;

use textgate_core::error::{Error, Result};

/// Parsed invitation: the portal code and the person's display name.
#[derive(Clone, Debug, PartialEq)]
pub struct Invite {
    pub code: String,
    pub full_name: String,
}

/// Extract `(subject, text body)` from a raw RFC822 message, preferring
/// the first `text/plain` part of a multipart message.
pub fn extract_subject_and_body(raw: &[u8]) -> Result<(String, String)> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|e| Error::Imap(format!("unparseable email: {e}")))?;

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();

    let body = if parsed.subparts.is_empty() {
        parsed
            .get_body()
            .map_err(|e| Error::Imap(format!("unreadable body: {e}")))?
    } else {
        let mut plain = None;
        collect_plain(&parsed, &mut plain);
        plain.unwrap_or_default()
    };

    Ok((subject, body))
}

fn collect_plain(mail: &mailparse::ParsedMail, out: &mut Option<String>) {
    if out.is_some() {
        return;
    }
    for part in &mail.subparts {
        if !part.subparts.is_empty() {
            collect_plain(part, out);
        } else if part.ctype.mimetype.to_lowercase().contains("text/plain") {
            if let Ok(body) = part.get_body() {
                *out = Some(body);
                return;
            }
        }
    }
}

/// Parse an invitation out of a subject/body pair.
///
/// Returns `None` for ordinary mail (wrong subject) or when the code
/// or name cannot be recovered — the caller just moves on to the next
/// candidate.
pub fn parse_invite(subject: &str, body: &str) -> Option<Invite> {
    if !subject.contains("Person in Custody:") {
        return None;
    }

    let code_line = body
        .lines()
        .find(|line| line.contains("Identification Code:"))?;
    let code = code_line.split(':').nth(1)?.trim().to_string();
    if code.is_empty() {
        warn!(subject, "invite email with empty identification code");
        return None;
    }

    // Subject tail: "LastName, FirstName".
    let name_part = subject.rsplit(':').next()?.trim();
    let (last_name, first_name) = name_part.split_once(", ")?;
    let full_name = format!("{} {}", first_name.trim(), last_name.trim());

    Some(Invite { code, full_name })
}

/// Convenience: raw message → invite, when it is one.
pub fn invite_from_raw(raw: &[u8]) -> Result<Option<Invite>> {
    let (subject, body) = extract_subject_and_body(raw)?;
    Ok(parse_invite(&subject, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE_BODY: &str = "You have a pending contact request.\n\
        Identification Code: 6F876NMY\n\
        Enter this code to be connected.";

    #[test]
    fn test_parse_invite() {
        let invite = parse_invite("Person in Custody: COOK, ZACHARY", INVITE_BODY).unwrap();
        assert_eq!(invite.code, "6F876NMY");
        assert_eq!(invite.full_name, "ZACHARY COOK");
    }

    #[test]
    fn test_parse_invite_with_prefix_in_subject() {
        let invite =
            parse_invite("Fwd: Person in Custody: SMITH, JOHN", INVITE_BODY).unwrap();
        assert_eq!(invite.full_name, "JOHN SMITH");
    }

    #[test]
    fn test_wrong_subject_is_not_an_invite() {
        assert_eq!(parse_invite("Vacation photos", INVITE_BODY), None);
    }

    #[test]
    fn test_body_without_code() {
        assert_eq!(
            parse_invite("Person in Custody: COOK, ZACHARY", "no code here"),
            None
        );
    }

    #[test]
    fn test_subject_without_comma_name() {
        assert_eq!(
            parse_invite("Person in Custody: MONONYM", INVITE_BODY),
            None
        );
    }

    #[test]
    fn test_extract_plain_email() {
        let raw = b"Subject: Person in Custody: COOK, ZACHARY\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            Identification Code: 6F876NMY\r\n";
        let (subject, body) = extract_subject_and_body(raw).unwrap();
        assert_eq!(subject, "Person in Custody: COOK, ZACHARY");
        assert!(body.contains("Identification Code: 6F876NMY"));
    }

    #[test]
    fn test_extract_multipart_prefers_plain() {
        let raw = b"Subject: Person in Custody: COOK, ZACHARY\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
            \r\n\
            --b1\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>Identification Code: WRONG</p>\r\n\
            --b1\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            Identification Code: 6F876NMY\r\n\
            --b1--\r\n";
        let invite = invite_from_raw(raw).unwrap().unwrap();
        assert_eq!(invite.code, "6F876NMY");
    }
}
