//! Prompt text and response schemas sent to the model. One profile per
//! artifact format; bump `PROMPT_VERSION` whenever wording or schema changes.

use crate::models::{ArtifactFormat, BloomsLevel, QuestionType};
use serde_json::{Value, json};

pub const PROMPT_VERSION: &str = "2";

pub fn toc_prompt(toc_text: &str) -> String {
    format!(
        "You are reading the opening pages of a textbook. Find its table of contents and list every chapter \
with the page it starts on and the page it ends on.\n\n\
Page numbers are whole integers such as 1, 15 or 138. Numbers with a decimal point such as 1.1, 2.14 or \
a range like 5.1-5.61 are section numbers, never page numbers. If the contents only show section ranges, \
use the printed page numbers from the page headers or footers, and if there are none, estimate from the \
chapter order. A chapter ends on the page before the next chapter starts.\n\n\
Respond with a JSON array of objects with the keys \"chapterTitle\", \"startPage\" and \"endPage\".\n\n\
Text of the opening pages:\n{toc_text}"
    )
}

pub fn chapter_list_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "chapterTitle": { "type": "STRING", "description": "The title of the chapter." },
                "startPage": { "type": "INTEGER", "description": "First page of the chapter." },
                "endPage": { "type": "INTEGER", "description": "Last page of the chapter." }
            },
            "required": ["chapterTitle", "startPage", "endPage"]
        }
    })
}

pub fn question_prompt(format: ArtifactFormat, board: &str, subject: &str, chapter_title: &str) -> String {
    let context = format!(
        "The chapter is \"{chapter_title}\" from a {subject} textbook for the {board} board."
    );
    match format {
        ArtifactFormat::Markdown => format!(
            "You are a teacher preparing revision material. {context} Extract every question in this chapter, \
including questions posed through figures, diagrams or charts. Give the full text of written questions and a \
precise description of what each figure-based question asks.\n\n\
Rate each question's difficulty (Easy, Medium or Hard) and its Bloom's taxonomy level (Remembering, \
Understanding, Applying, Analyzing, Evaluating or Creating).\n\n\
Answer in Markdown, one block per question:\n\n\
### Question <number>\n\n**Question:** <text>\n\n**Difficulty:** <level>\n\n**Bloom's Level:** <level>\n\n\
If the chapter has no questions, answer only: No questions found in this chapter."
        ),
        ArtifactFormat::QuestionBank => format!(
            "You are a teacher building a question bank. {context} Extract every question in this chapter, \
including questions posed through figures, diagrams or charts.\n\n\
For each question give questionNumber, questionText, questionType (one of: {types}), suggestedMarks, \
dokLevel (1 recall, 2 skill or concept, 3 strategic thinking, 4 extended thinking), bloomsLevel (one of: \
{blooms}) and difficulty (Easy, Medium or Hard).\n\n\
Respond with a JSON array. Respond with [] if the chapter has no questions.",
            types = QuestionType::ALL.map(QuestionType::label).join(", "),
            blooms = BloomsLevel::ALL
                .map(|level| format!("{level:?}"))
                .join(", "),
        ),
    }
}

pub fn question_bank_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "questionNumber": { "type": "INTEGER" },
                "questionText": { "type": "STRING" },
                "questionType": {
                    "type": "STRING",
                    "enum": QuestionType::ALL.map(QuestionType::label)
                },
                "suggestedMarks": { "type": "INTEGER" },
                "dokLevel": { "type": "INTEGER" },
                "bloomsLevel": {
                    "type": "STRING",
                    "enum": BloomsLevel::ALL.map(|level| format!("{level:?}"))
                },
                "difficulty": { "type": "STRING", "enum": ["Easy", "Medium", "Hard"] }
            },
            "required": [
                "questionNumber", "questionText", "questionType", "suggestedMarks",
                "dokLevel", "bloomsLevel", "difficulty"
            ]
        }
    })
}

/// Ollama's `format` field takes a standard JSON schema: same shape, lower-case type names.
pub fn to_json_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let value = match (key.as_str(), value) {
                        ("type", Value::String(t)) => Value::String(t.to_ascii_lowercase()),
                        _ => to_json_schema(value),
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(to_json_schema).collect()),
        other => other.clone(),
    }
}
