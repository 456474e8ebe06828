//! Inbox page and AJAX-postback parsing.
//!
//! The inbox is a classic ASP.NET data grid: the page carries a
//! compressed viewstate, each message row fires a server event
//! (`__EVENTARGUMENT = rc{index}`), and the server answers with a
//! composite AJAX payload whose `updatePanel` slice holds the opened
//! message. Everything here is pure parsing; the HTTP half lives in
//! the engine's puller.

use regex::Regex;
use scraper::{Html, Selector};

use textgate_core::error::{Error, Result};

use crate::forms::PortalFormState;

/// Grid control that owns the row postbacks.
pub const INBOX_GRID_TARGET: &str = "ctl00$mainContentPlaceHolder$inboxGridView";

/// Headers the grid's script manager expects on a partial postback.
pub const AJAX_HEADERS: &[(&str, &str)] = &[
    ("Accept", "*/*"),
    ("Accept-Language", "en-US,en;q=0.5"),
    ("X-MicrosoftAjax", "Delta=true"),
    ("X-Requested-With", "XMLHttpRequest"),
];

// ─────────────────────────────────────────────
// Inbox list page
// ─────────────────────────────────────────────

/// One row of the inbox grid, as listed (not yet opened).
#[derive(Clone, Debug, PartialEq)]
pub struct InboxRow {
    pub index: usize,
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
}

/// Parse the inbox page into its form state and message rows.
///
/// A missing viewstate is a protocol error (the page is not the inbox
/// we expect); an empty row list is just an empty inbox.
pub fn parse_inbox(html: &str) -> Result<(PortalFormState, Vec<InboxRow>)> {
    let state = PortalFormState::hidden_from_html(html);
    if state.compressed_viewstate().is_none() {
        return Err(Error::Protocol(
            "__COMPRESSEDVIEWSTATE not found in inbox page".to_string(),
        ));
    }

    let doc = Html::parse_document(html);
    let row_selector = Selector::parse("tr").unwrap();
    let from_selector = Selector::parse("th.MessageDataGrid.Item a.tooltip span").unwrap();
    let subject_selector = Selector::parse("td.MessageDataGrid.Item a.tooltip span").unwrap();
    let date_selector = Selector::parse("td.MessageDataGrid.Item:nth-child(4)").unwrap();
    let message_id_re =
        Regex::new(r#"(?i)(Command="REPLY"\s+MessageId="(\d+)"|messageid="(\d+)")"#).unwrap();

    let mut rows = Vec::new();
    for tr in doc.select(&row_selector) {
        let highlighted = tr
            .value()
            .attr("onmouseover")
            .map(|v| v.starts_with("this.className='MessageDataGrid ItemHighlighted'"))
            .unwrap_or(false);
        if !highlighted {
            continue;
        }

        let index = rows.len();
        let row_html = tr.html();
        let message_id = match message_id_re.captures(&row_html) {
            Some(caps) => caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string()),
            None => None,
        };
        let Some(message_id) = message_id else {
            // Row without a message id cannot be opened; skip it and
            // keep walking the rest of the grid.
            tracing::warn!(index, "inbox row without message id");
            continue;
        };

        let text_of = |selector: &Selector| {
            tr.select(selector)
                .next()
                .map(|el| el.text().collect::<String>().trim().to_string())
                .unwrap_or_default()
        };

        rows.push(InboxRow {
            index,
            message_id,
            from: text_of(&from_selector),
            subject: text_of(&subject_selector),
            date: text_of(&date_selector),
        });
    }

    Ok((state, rows))
}

/// Form data for the server event that opens row `index`.
pub fn row_event_data(state: &PortalFormState, index: usize) -> Result<Vec<(String, String)>> {
    let viewstate = state
        .compressed_viewstate()
        .ok_or_else(|| Error::Protocol("form state has no compressed viewstate".to_string()))?;

    Ok(vec![
        ("__EVENTTARGET".to_string(), INBOX_GRID_TARGET.to_string()),
        ("__EVENTARGUMENT".to_string(), format!("rc{index}")),
        ("__COMPRESSEDVIEWSTATE".to_string(), viewstate.to_string()),
        ("__ASYNCPOST".to_string(), "true".to_string()),
        (
            "ctl00$topScriptManager".to_string(),
            INBOX_GRID_TARGET.to_string(),
        ),
    ])
}

// ─────────────────────────────────────────────
// AJAX payload
// ─────────────────────────────────────────────

/// Cut the `updatePanel|ctl00_topUpdatePanel` slice out of a composite
/// AJAX response.
pub fn extract_update_panel(response: &str) -> Option<String> {
    let re = Regex::new(r"(?s)\|updatePanel\|ctl00_topUpdatePanel\|(.*?)\|").unwrap();
    re.captures(response)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// The opened message, as recovered from the update-panel slice.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDetail {
    pub from: String,
    pub date: String,
    pub subject: String,
    pub body: String,
}

/// Parse the opened-message fields out of the update-panel HTML and
/// reduce the body to its most recent segment.
pub fn parse_message_detail(panel_html: &str) -> Result<MessageDetail> {
    let doc = Html::parse_document(panel_html);

    let value_of = |id: &str| -> Option<String> {
        let selector = Selector::parse(&format!("#{id}")).ok()?;
        let el = doc.select(&selector).next()?;
        match el.value().attr("value") {
            Some(v) => Some(v.to_string()),
            None => Some(el.text().collect::<String>().trim().to_string()),
        }
    };

    let from = value_of("ctl00_mainContentPlaceHolder_fromTextBox")
        .ok_or_else(|| Error::Protocol("from field missing in message panel".to_string()))?;
    let date = value_of("ctl00_mainContentPlaceHolder_dateTextBox").unwrap_or_default();
    let subject = value_of("ctl00_mainContentPlaceHolder_subjectTextBox").unwrap_or_default();
    let full_body = value_of("ctl00_mainContentPlaceHolder_messageTextBox").unwrap_or_default();

    Ok(MessageDetail {
        from,
        date,
        subject,
        body: most_recent_segment(&full_body),
    })
}

// ─────────────────────────────────────────────
// Reply-thread splitting
// ─────────────────────────────────────────────

/// Reduce a threaded message to the portion before the first reply
/// indicator. The three patterns are the whole contract; new ones are
/// added here deliberately, with tests.
pub fn most_recent_segment(full_message: &str) -> String {
    let patterns = [
        r"(?is)-----.*?on \d{1,2}/\d{1,2}/\d{4} \d{1,2}:\d{2} (AM|PM) wrote:",
        r"(?i)[^\n]*? on \d{1,2}/\d{1,2}/\d{4} \d{1,2}:\d{2} (AM|PM) wrote",
        r">",
    ];

    for pattern in patterns {
        let re = Regex::new(pattern).unwrap();
        let mut parts = re.splitn(full_message, 2);
        let first = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return first.trim().to_string();
        }
    }

    full_message.trim().to_string()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
