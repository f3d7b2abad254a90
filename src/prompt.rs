//! Prompt construction for the etymology completion.
//!
//! The model does not reliably honour structural instructions, so the
//! template shows the JSON shape once and then restates the same
//! constraints as numbered rules. The normalizer still has to cope with
//! whatever comes back.

/// Sub-fields the model must return inside `oldest_root`, in contract order.
pub const ROOT_FIELDS: [&str; 4] = ["word", "pronunciation", "language", "meaning"];

const TEMPLATE: &str = r#"Analyze the etymology of the word "${word}" and provide a response in the following JSON structure:
{
  "oldest_root": {
    "word": "Write the oldest known root word (preferably proto-Indo-European root if applicable). Ask yourself the question: What is the oldest root word that is related to the word ${word}? Just write the word, don't add any other text.",
    "pronunciation": "Provide the pronunciation of this root word in simple english",
    "language": "Specify the language of this root word",
    "meaning": "Provide the original meaning of this root word"
  },
  "evolution": "Describe how the word evolved through time, starting from the oldest root word and moving forward in time",
  "related_words": "List and describe related words that share this root, both in the original language and other languages. Write the [word] - [meaning] for each related word."
}

Important:
1. The oldest_root MUST be a JSON object with EXACTLY these four fields: word, pronunciation, language, and meaning.
2. The pronunciation field is REQUIRED and MUST NOT be omitted.
3. The evolution and related_words should be strings.
4. Do not include any additional fields or nested objects."#;

/// Render the instruction sent to the completion API for `word`.
///
/// The word is embedded verbatim. Callers are responsible for rejecting
/// empty input before getting here.
pub fn build_prompt(word: &str) -> String {
    TEMPLATE.replace("${word}", word)
}
