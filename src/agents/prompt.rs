use crate::models::RetrievedPassage;

const PASSAGE_SEPARATOR: &str = "\n\n";

const INSTRUCTIONS: &str = "\
You are a legal assistant specialized in Indian law.

Your task is to answer legal questions accurately and clearly based on the provided legal documents, which may include Acts, Sections, Penalties, Case Laws, Procedures, and Notifications from Indian law.

Follow these rules:

1. Always assume the user is referring to Indian law unless stated otherwise.

2. Use only the information given in the context.
Do **not** guess, assume, or generate answers outside the provided legal content.
If the answer is not present, respond with:
**\u{201c}Sorry, I cannot answer that based on the available legal documents.\u{201d}**

3. When answering:
Be concise and factual (1-3 sentences).
Mention the relevant **Act name**, **Section number**, and **penalty or procedure**, if available.
Use formal, neutral tone. Do not offer personal opinions or interpretations.

4. If asked whether something is legal, allowed, punishable, or available:
Start your answer with \u{201c}Yes,\u{201d} or \u{201c}No,\u{201d} followed by a short explanation based on the context.

5. If multiple questions are asked, answer each one briefly and clearly.

6. For casual inputs (hello, namaste, thanks):
Respond politely and briefly.

Never give legal advice, recommendations, or personal interpretations.
Never generate content not found in the context.
";

/// Builds the generation prompt from retrieved passages.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    context_limit: usize,
}

impl PromptBuilder {
    pub fn new(context_limit: usize) -> Self {
        Self { context_limit }
    }

    pub fn build(&self, query: &str, passages: &[RetrievedPassage]) -> String {
        let context = build_context(passages, self.context_limit);
        format!(
            "{INSTRUCTIONS}\n---\n[Context Starts]\n{context}\n[Context Ends]\n\nQuestion: {query}\n\nAnswer:\n"
        )
    }
}

/// Join passage texts with a blank line, capped at `limit` characters.
pub fn build_context(passages: &[RetrievedPassage], limit: usize) -> String {
    let mut context = String::new();
    let mut used = 0;

    for (i, passage) in passages.iter().enumerate() {
        let pieces = if i == 0 {
            [passage.text.as_str(), ""]
        } else {
            [PASSAGE_SEPARATOR, passage.text.as_str()]
        };
        for piece in pieces {
            let remaining = limit - used;
            let len = piece.chars().count();
            if len > remaining {
                context.push_str(truncate_chars(piece, remaining));
                return context;
            }
            context.push_str(piece);
            used += len;
        }
    }
    context
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
