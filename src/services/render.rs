use crate::error::PipelineError;
use crate::models::{Chapter, QuestionBank};
use printpdf::{BuiltinFont, Mm, PdfDocument};
use std::io::BufWriter;

/// `chapters.txt`: one `<title>: Pages <start> - <end>` line per chapter.
pub fn chapter_index(chapters: &[Chapter]) -> String {
    chapters
        .iter()
        .map(Chapter::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn markdown_with_metadata(board: &str, subject: &str, body: &str) -> String {
    format!("---\n**Board:** {board}\n**Subject:** {subject}\n---\n\n{body}")
}

pub fn question_bank_markdown(bank: &QuestionBank) -> String {
    let mut out = markdown_with_metadata(&bank.board, &bank.subject, "");
    out.push_str(&format!("# {}\n\n", bank.chapter_title));
    out.push_str(&format!("Total Questions: {}\n\n", bank.questions.len()));

    if bank.questions.is_empty() {
        out.push_str("No questions found in this chapter.\n");
        return out;
    }

    for q in &bank.questions {
        out.push_str(&format!(
            "### Question {}\n\n\
             **Question:** {}\n\n\
             - **Type:** {}\n\
             - **Marks:** {}\n\
             - **DOK Level:** {}\n\
             - **Bloom's Level:** {:?}\n\
             - **Difficulty:** {:?}\n\n",
            q.question_number,
            q.question_text,
            q.question_type.label(),
            q.suggested_marks,
            q.dok_level.get(),
            q.blooms_level,
            q.difficulty
        ));
    }
    out
}

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 18.0;
const LINE: f32 = 5.0;
const WRAP_CHARS: usize = 95;

/// A printable question paper for one chapter.
pub fn question_bank_pdf(bank: &QuestionBank) -> Result<Vec<u8>, PipelineError> {
    let title = format!("{} - Questions", bank.chapter_title);
    let (doc, page1, layer1) =
        PdfDocument::new(&title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| PipelineError::Render(format!("PDF font error: {e}")))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| PipelineError::Render(format!("PDF font error: {e}")))?;

    let mut layer = doc.get_page(page1).get_layer(layer1);
    let mut y = PAGE_HEIGHT - MARGIN;

    layer.use_text(format!("Board: {}", bank.board), 10.0, Mm(MARGIN), Mm(y), &bold);
    y -= LINE;
    layer.use_text(format!("Subject: {}", bank.subject), 10.0, Mm(MARGIN), Mm(y), &bold);
    y -= LINE * 1.5;
    layer.use_text(format!("Chapter: {}", bank.chapter_title), 14.0, Mm(MARGIN), Mm(y), &bold);
    y -= LINE * 2.0;
    layer.use_text(
        format!("Total Questions: {}", bank.questions.len()),
        10.0,
        Mm(MARGIN),
        Mm(y),
        &font,
    );
    y -= LINE * 2.0;

    for q in &bank.questions {
        let text_lines = wrap_text(&q.question_text, WRAP_CHARS);
        let meta = [
            format!("Type: {}", q.question_type.label()),
            format!("Marks: {}", q.suggested_marks),
            format!("DOK Level: {}", q.dok_level.get()),
            format!("Bloom's: {:?}", q.blooms_level),
            format!("Difficulty: {:?}", q.difficulty),
        ];

        // Keep a question's heading together with at least its first lines.
        if y - LINE * 4.0 < MARGIN {
            let (page, page_layer) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
            layer = doc.get_page(page).get_layer(page_layer);
            y = PAGE_HEIGHT - MARGIN;
        }

        layer.use_text(
            format!("Question {}", q.question_number),
            12.0,
            Mm(MARGIN),
            Mm(y),
            &bold,
        );
        y -= LINE * 1.5;

        let body = text_lines
            .iter()
            .map(|line| (line.as_str(), 10.0, MARGIN))
            .chain(meta.iter().map(|line| (line.as_str(), 9.0, MARGIN + 6.0)));
        for (line, size, x) in body {
            if y < MARGIN {
                let (page, page_layer) = doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
                layer = doc.get_page(page).get_layer(page_layer);
                y = PAGE_HEIGHT - MARGIN;
            }
            layer.use_text(line, size, Mm(x), Mm(y), &font);
            y -= LINE;
        }
        y -= LINE * 1.5;
    }

    let mut buf = BufWriter::new(Vec::new());
    doc.save(&mut buf)
        .map_err(|e| PipelineError::Render(format!("PDF save error: {e}")))?;
    buf.into_inner()
        .map_err(|e| PipelineError::Render(format!("PDF buffer error: {e}")))
}

fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.chars().count() + word.chars().count() + 1 > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}
