//! The five prompt templates the consolidator uses to drive its LLM
//! calls (§4.7). Each asks for a narrow, strictly-JSON response so the
//! tolerant parser in `halcyon_llm::extract_json_output` has the best
//! chance of succeeding.

const MAX_EXTRACT_CHARS: usize = 4000;

pub fn extract_facts_prompt(conversation_text: &str) -> String {
    let truncated: String = conversation_text.chars().take(MAX_EXTRACT_CHARS).collect();
    format!(
        "Read the conversation below and extract durable facts and named \
         entities worth remembering long-term. Ignore small talk. Return ONLY \
         JSON: {{\"facts\":[{{\"content\":\"...\",\"importance\":1-10,\"related_entities\":\"comma,separated\"}}],\
         \"entities\":[{{\"name\":\"...\",\"type\":\"person|place|project|organization|other\",\
         \"description\":\"...\",\"importance\":1-10}}]}}. Omit either array if there's \
         nothing to add.\n\nConversation:\n{truncated}"
    )
}

pub fn contradiction_check_prompt(existing_content: &str, new_fact: &str) -> String {
    format!(
        "Does the new fact contradict the existing memory below? Return ONLY \
         JSON: {{\"contradicts\":true|false,\"keep\":\"existing|new\",\"reason\":\"brief\"}}.\n\n\
         Existing memory: {existing_content}\nNew fact: {new_fact}"
    )
}

pub fn reflection_prompt(memory_text: &str) -> String {
    format!(
        "Review the recent memories below and write 1-3 higher-level \
         reflections connecting patterns across them. Return ONLY JSON: \
         {{\"reflections\":[{{\"content\":\"...\",\"topic\":\"...\",\"importance\":1-10}}]}}. \
         Return an empty array if nothing rises above the individual memories.\n\n\
         Memories:\n{memory_text}"
    )
}

pub fn pruning_prompt(candidates_text: &str) -> String {
    format!(
        "Each candidate below has decayed in relevance. For each, decide \
         whether to prune it or keep it a while longer. Return ONLY JSON: \
         {{\"decisions\":[{{\"id\":\"...\",\"action\":\"prune|keep\",\"reason\":\"brief\"}}]}}, \
         one decision per candidate listed.\n\nCandidates:\n{candidates_text}"
    )
}

pub fn core_review_prompt(over_by_tokens: i64, entries_text: &str) -> String {
    format!(
        "Core memory is {over_by_tokens} tokens over budget. Choose entries to \
         archive out of core into long-term storage (they are not deleted, just \
         moved) so the budget is satisfied again, preferring the least currently \
         useful entries. Return ONLY JSON: {{\"archive\":[{{\"id\":\"...\",\"reason\":\"brief\"}}]}}.\
         \n\nEntries:\n{entries_text}"
    )
}
