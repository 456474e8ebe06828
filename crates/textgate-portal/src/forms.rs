//! Opaque ASP.NET form state.
//!
//! The portal threads its state through hidden inputs (`__VIEWSTATE`,
//! `__COMPRESSEDVIEWSTATE`, event validation fields). We never
//! interpret or mutate these values; a `PortalFormState` is rebuilt
//! from the page before every request that needs one.

use scraper::{Html, Selector};

/// Hidden-input snapshot of one rendered portal page.
#[derive(Clone, Debug, Default)]
pub struct PortalFormState {
    fields: Vec<(String, String)>,
}

impl PortalFormState {
    /// Capture every `input`/`textarea`/`select` that carries a name.
    /// Scoped to the `aspnetForm` form when present, the whole document
    /// otherwise.
    pub fn from_html(html: &str) -> Self {
        let doc = Html::parse_document(html);
        let form_selector = Selector::parse("form#aspnetForm").unwrap();
        let input_selector = Selector::parse("input, textarea, select").unwrap();

        let mut fields = Vec::new();
        let mut collect = |el: scraper::ElementRef| {
            if let Some(name) = el.value().attr("name") {
                let value = el.value().attr("value").unwrap_or("").to_string();
                fields.push((name.to_string(), value));
            }
        };

        if let Some(form) = doc.select(&form_selector).next() {
            for el in form.select(&input_selector) {
                collect(el);
            }
        } else {
            for el in doc.select(&input_selector) {
                collect(el);
            }
        }

        Self { fields }
    }

    /// Only the hidden inputs — what the login POST carries alongside
    /// the credentials.
    pub fn hidden_from_html(html: &str) -> Self {
        let doc = Html::parse_document(html);
        let selector = Selector::parse("input[type=\"hidden\"]").unwrap();

        let fields = doc
            .select(&selector)
            .filter_map(|el| {
                let name = el.value().attr("name")?;
                let value = el.value().attr("value").unwrap_or("");
                Some((name.to_string(), value.to_string()))
            })
            .collect();

        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn compressed_viewstate(&self) -> Option<&str> {
        self.get("__COMPRESSEDVIEWSTATE")
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.fields
    }

    /// A fresh field list seeded from this state with `overrides`
    /// applied on top (replacing same-named fields, appending new
    /// ones). The state itself stays untouched.
    pub fn with_overrides(&self, overrides: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut out = self.fields.clone();
        for (name, value) in overrides {
            match out.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = value.to_string(),
                None => out.push((name.to_string(), value.to_string())),
            }
        }
        out
    }
}
