//! Grounded context assembly
//!
//! Serializes deduplicated results into tag-delimited blocks, one element per
//! entity with fixed sub-fields in fixed order. Text is escaped so that
//! arbitrary content cannot break the structure.

use crate::prompts;
use lexforge_search::{PrimaryResult, SecondaryResult};
use std::borrow::Cow;
use std::fmt::Write;

/// Escape `&`, `<` and `>`
pub fn escape_xml(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>']) {
        return Cow::Borrowed(text);
    }

    let mut escaped = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

fn element(out: &mut String, tag: &str, fields: &[(&str, &str)]) {
    let _ = writeln!(out, "    <{}>", tag);
    for (name, value) in fields {
        let _ = writeln!(out, "        <{name}>{}</{name}>", escape_xml(value));
    }
    let _ = writeln!(out, "    </{}>", tag);
}

/// `<clicPages>` block
pub fn pages_xml(pages: &[PrimaryResult]) -> String {
    let mut out = String::from("<clicPages>\n");
    for page in pages {
        element(
            &mut out,
            "page",
            &[
                ("url", page.url.as_str()),
                ("topic", page.topic.as_str()),
                ("title", page.title.as_str()),
                ("content", page.content.as_str()),
            ],
        );
    }
    out.push_str("</clicPages>");
    out
}

/// `<legislationSections>` block
pub fn sections_xml(sections: &[SecondaryResult]) -> String {
    let mut out = String::from("<legislationSections>\n");
    for section in sections {
        element(
            &mut out,
            "section",
            &[
                ("url", section.url.as_str()),
                ("capNumber", section.cap_number.as_str()),
                ("capTitle", section.cap_title.as_str()),
                ("sectionNumber", section.section_number.as_str()),
                ("sectionHeading", section.section_heading.as_str()),
                ("content", section.content.as_str()),
            ],
        );
    }
    out.push_str("</legislationSections>");
    out
}

/// Full grounding message for the answer
pub fn assemble(pages: &[PrimaryResult], sections: &[SecondaryResult]) -> String {
    prompts::sources_message(&pages_xml(pages), &sections_xml(sections))
}
