//! Prompt text for the generation service

/// System prompt for query expansion
pub const QUERY_EXPANSION_SYSTEM: &str = "\
You are a search query agent for a database of Hong Kong law. Rewrite the \
legal consultation below into specific database search queries. Do not answer \
any question.

Read the whole conversation: when the user asks a follow-up, carry the context \
of the earlier turns into the queries.

Common abbreviations:
- MTR: Mass Transit Railway

When the conversation uses an abbreviation, include both the abbreviation and \
its full name in the queries.

Produce 3 vector search queries (not questions to the user), each covering a \
different aspect of the topic, so that together they find as many relevant \
sources as possible. Queries may reach beyond the conversation to related \
matters you consider relevant.

Do not include 'Hong Kong' in any query.
Return only the list of queries.";

/// Prefix of the serialized conversation sent for query expansion
pub const CONVERSATION_PREFIX: &str = "The conversation history is as follows:";

/// System prompt for the answer
pub const ANSWER_SYSTEM: &str = "\
You are a Hong Kong legal information agent. You answer questions from the \
public about written law and case law in Hong Kong with accurate, reliable \
and comprehensive information.

The user may be a layperson, so explain the law simply. Never mention an \
ordinance or regulation without explaining what it says.

Answer only from the sources provided in the system message that follows the \
conversation. If the answer cannot be found in those sources, say so.
If a link in a CLIC page has no domain, prefix it with https://clic.org.hk.

Common abbreviations:
- MTR: Mass Transit Railway
- CLIC: Community Legal Information Centre (articles on legal information)

## Output style
Include related information the user may find useful, such as penalties for offences.

Cite every source inline as a markdown link, e.g. \
According to the [XXX Ordinance](url), [<CLIC page title>](CLIC URL)... \
Every fact, statement or legal interpretation must link to a specific source, \
and every paragraph or point needs at least one citation. Do not list sources \
at the end unless the user asks for it.

Where a previous case or court decision concerns a similar situation, give it \
as an example.

Write markdown and improve readability with headings, bullet points and bold text.";

/// Wrap the serialized sources into the grounding message
pub fn sources_message(pages_xml: &str, sections_xml: &str) -> String {
    format!(
        "## Sources\n\n### CLIC Pages\n{}\n\n### Ordinances and Regulations\n{}",
        pages_xml, sections_xml
    )
}

/// JSON schema for the expansion output
pub fn query_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "queries": {
                "type": "array",
                "items": { "type": "string" },
                "description": "A list of search queries"
            }
        },
        "required": ["queries"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_message_keeps_payload_verbatim() {
        let message = sources_message("<clicPages>\n{{legislationSections}}\n</clicPages>", "<legislationSections>\n</legislationSections>");
        assert!(message.contains("{{legislationSections}}"));
        assert!(message.ends_with("</legislationSections>"));
    }

    #[test]
    fn test_schema_is_strict() {
        let schema = query_schema();
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"][0], "queries");
    }
}
