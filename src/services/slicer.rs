use crate::error::PipelineError;
use crate::models::Chapter;
use lopdf::Document;
use tracing::{debug, warn};

/// A loaded PDF owned by one run. Slicing works on clones, so the handle
/// itself is never mutated after load.
pub struct SourceDocument {
    document: Document,
    page_count: u32,
}

impl SourceDocument {
    pub fn load(bytes: &[u8]) -> Result<Self, PipelineError> {
        let document = Document::load_mem(bytes)?;
        let page_count = document.get_pages().len() as u32;
        Ok(Self {
            document,
            page_count,
        })
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Text of pages `start..=end` (1-based, clamped to the document), one
    /// blank line between pages. Pages without a usable text layer are
    /// skipped.
    pub fn extract_text(&self, start: u32, end: u32) -> Result<String, PipelineError> {
        let Some((start, end)) = clamp_range(start, end, self.page_count) else {
            return Ok(String::new());
        };

        let mut text = String::new();
        for page in start..=end {
            match self.document.extract_text(&[page]) {
                Ok(page_text) => {
                    text.push_str(page_text.trim());
                    text.push_str("\n\n");
                }
                Err(e) => warn!("No text extracted from page {page}: {e}"),
            }
        }
        Ok(text)
    }

    /// Bytes of a new PDF holding exactly the chapter's pages, in order.
    /// `None` when the clamped range is empty; the caller skips the chapter.
    pub fn slice(&self, chapter: &Chapter) -> Result<Option<Vec<u8>>, PipelineError> {
        let Some((start, end)) = clamp_range(chapter.start_page, chapter.end_page, self.page_count)
        else {
            return Ok(None);
        };

        // lopdf numbers pages from 1, same as chapter ranges.
        let outside: Vec<u32> = (1..start).chain(end + 1..=self.page_count).collect();

        let mut sliced = self.document.clone();
        if !outside.is_empty() {
            sliced.delete_pages(&outside);
            sliced.prune_objects();
        }

        let mut bytes = Vec::new();
        sliced.save_to(&mut bytes)?;
        debug!(
            "Sliced pages {start}-{end} of {} into {} bytes",
            self.page_count,
            bytes.len()
        );
        Ok(Some(bytes))
    }
}

/// `max(1, start)..=min(page_count, end)`, or `None` if that is empty.
pub fn clamp_range(start: u32, end: u32, page_count: u32) -> Option<(u32, u32)> {
    let start = start.max(1);
    let end = end.min(page_count);
    (start <= end).then_some((start, end))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{Document, Object, Stream, dictionary};

    /// An in-memory PDF whose page `n` reads "Page n".
    pub fn pdf_with_pages(count: u32) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut kids: Vec<Object> = Vec::new();
        for n in 1..=count {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 24.into()]),
                    Operation::new("Td", vec![100.into(), 600.into()]),
                    Operation::new("Tj", vec![Object::string_literal(format!("Page {n}"))]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().expect("encode page content"),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => i64::from(count),
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("save fixture pdf");
        bytes
    }
}
