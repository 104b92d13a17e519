//! Per-recipient template rendering

use regex::{Captures, Regex};
use std::collections::HashMap;
use volley_storage::models::Recipient;

/// Substitute `{{variable}}` placeholders with recipient data.
///
/// Unknown variables render as the empty string rather than failing the
/// whole send.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let re = Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("static regex");
    re.replace_all(template, |caps: &Captures| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    })
    .into_owned()
}

/// Build the variable map for one recipient
pub fn recipient_vars(
    recipient: &Recipient,
    subject: &str,
    unsubscribe_url: &str,
) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("email".to_string(), recipient.email.clone());
    vars.insert(
        "firstname".to_string(),
        recipient.first_name.clone().unwrap_or_default(),
    );
    vars.insert(
        "lastname".to_string(),
        recipient.last_name.clone().unwrap_or_default(),
    );
    vars.insert(
        "company".to_string(),
        recipient.company.clone().unwrap_or_default(),
    );
    vars.insert("subject".to_string(), subject.to_string());
    vars.insert("unsubscribe_url".to_string(), unsubscribe_url.to_string());

    // Custom attributes may override nothing but can add new variables
    if let Some(map) = recipient.attributes.as_object() {
        for (key, value) in map {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.entry(key.clone()).or_insert(rendered);
        }
    }

    vars
}
