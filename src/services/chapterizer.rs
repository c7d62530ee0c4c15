use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::models::{ArtifactFormat, BookMetadata, Chapter, ChapterArtifact, RunState};
use crate::run::RunContext;
use crate::services::prompts::PROMPT_VERSION;
use crate::services::render;
use crate::services::slicer::SourceDocument;
use crate::services::traits::{ArtifactSink, ChapterDetector, ExtractionRequest, QuestionExtractor};
use crate::services::validator::PageRangeValidator;
use crate::utils::chapter_file_stem;
use std::sync::Arc;
use tracing::error;

pub const CHAPTER_INDEX_FILE: &str = "chapters.txt";

/// Everything one run needs from the uploader.
pub struct RunRequest {
    pub pdf: Vec<u8>,
    pub metadata: BookMetadata,
    pub format: ArtifactFormat,
    /// Pause for a hand-checked chapter list before slicing.
    pub review: bool,
}

pub struct Chapterizer<D, E, S> {
    detector: Arc<D>,
    extractor: Arc<E>,
    sink: S,
    settings: PipelineSettings,
    validator: PageRangeValidator,
}

impl<D, E, S> Chapterizer<D, E, S>
where
    D: ChapterDetector,
    E: QuestionExtractor,
    S: ArtifactSink,
{
    pub fn new(detector: Arc<D>, extractor: Arc<E>, sink: S, settings: PipelineSettings) -> Self {
        let validator = PageRangeValidator::new(settings.validator.clone());
        Self {
            detector,
            extractor,
            sink,
            settings,
            validator,
        }
    }

    /// Runs the whole book and leaves the context in `done` or `error`.
    /// Files written before a failure stay where they are.
    pub async fn process_book(&self, ctx: &RunContext, request: RunRequest) {
        match self.run(ctx, &request).await {
            Ok(()) => {
                ctx.log("All chapters have been processed. Task finished.");
                ctx.finish("Processing complete! All files have been written.");
            }
            Err(e) => {
                error!("Run failed: {e}");
                ctx.fail(&e.to_string());
            }
        }
    }

    async fn run(&self, ctx: &RunContext, request: &RunRequest) -> Result<(), PipelineError> {
        let metadata = &request.metadata;
        ctx.log("Process started.");
        ctx.log(format!(
            "Board: {}, Subject: {}",
            metadata.board, metadata.subject
        ));

        ctx.set_state(
            RunState::LoadingPdf,
            "Loading PDF and extracting table of contents...",
        );
        let source = SourceDocument::load(&request.pdf)?;
        ctx.log(format!("PDF loaded ({} pages).", source.page_count()));
        let toc_pages = self.settings.toc_page_limit;
        ctx.log(format!(
            "Extracting text from first {toc_pages} pages for Table of Contents analysis."
        ));
        let toc_text = source.extract_text(1, toc_pages)?;
        ctx.log("Text extraction complete.");

        ctx.set_state(RunState::AnalyzingToc, "Analyzing table of contents...");
        ctx.log(format!(
            "Sending text to the model for chapter detection (prompt v{PROMPT_VERSION})."
        ));
        let candidates = self.detector.detect(&toc_text).await?;
        ctx.log(format!("Model returned {} chapter candidates.", candidates.len()));

        let validated = self.validator.validate(candidates, self.settings.page_cap)?;
        for diagnostic in &validated.diagnostics {
            ctx.log(diagnostic.to_string());
        }
        let mut chapters = validated.chapters;
        ctx.log(format!("Identified {} chapters.", chapters.len()));
        ctx.set_chapters(&chapters);
        self.emit_index(ctx, &chapters)?;

        if request.review {
            chapters = self.wait_for_review(ctx, chapters).await?;
        }

        self.ensure_not_cancelled(ctx)?;
        ctx.set_state(
            RunState::ProcessingChapters,
            "Chapter list saved. Processing individual chapters...",
        );

        let total = chapters.len();
        for (index, chapter) in chapters.iter().enumerate() {
            self.ensure_not_cancelled(ctx)?;
            let ordinal = index + 1;

            ctx.set_progress(format!(
                "Slicing Chapter {ordinal}/{total}: \"{}\"",
                chapter.title
            ));
            ctx.log(format!(
                "Slicing Chapter {ordinal}: \"{}\" (pages {}-{}, {} pages).",
                chapter.title,
                chapter.start_page,
                chapter.end_page,
                chapter.page_span()
            ));
            let Some(chapter_pdf) = source.slice(chapter)? else {
                ctx.log(format!(
                    "Skipping Chapter {ordinal} - page range seems invalid or empty."
                ));
                continue;
            };
            ctx.log(format!(
                "Slicing complete. Chapter size: {} KB.",
                (chapter_pdf.len() as f64 / 1024.0).round()
            ));

            ctx.set_progress(format!(
                "Analyzing Chapter {ordinal}/{total}: \"{}\"",
                chapter.title
            ));
            ctx.log("Sending chapter to the model for question extraction.");
            let extraction = ExtractionRequest {
                board: &metadata.board,
                subject: &metadata.subject,
                chapter_title: &chapter.title,
                format: request.format,
            };
            let artifact = self.extractor.extract(&chapter_pdf, &extraction).await?;
            ctx.log("Received analysis from the model.");

            self.emit_chapter(ctx, ordinal, chapter, artifact)?;
        }

        Ok(())
    }

    async fn wait_for_review(
        &self,
        ctx: &RunContext,
        proposed: Vec<Chapter>,
    ) -> Result<Vec<Chapter>, PipelineError> {
        self.ensure_not_cancelled(ctx)?;
        let pending = ctx.await_review();
        ctx.log("Waiting for the chapter list to be reviewed.");
        let confirmed = pending.await.map_err(|_| PipelineError::Cancelled)?;
        self.ensure_not_cancelled(ctx)?;
        if confirmed.is_empty() {
            return Err(PipelineError::Review("no chapters were confirmed".into()));
        }

        ctx.log(format!(
            "Chapter list confirmed with {} chapters.",
            confirmed.len()
        ));
        if confirmed != proposed {
            ctx.set_chapters(&confirmed);
            self.emit_index(ctx, &confirmed)?;
        }
        Ok(confirmed)
    }

    fn ensure_not_cancelled(&self, ctx: &RunContext) -> Result<(), PipelineError> {
        if ctx.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn emit_index(&self, ctx: &RunContext, chapters: &[Chapter]) -> Result<(), PipelineError> {
        ctx.log(format!("Writing {CHAPTER_INDEX_FILE}."));
        self.save(ctx, CHAPTER_INDEX_FILE, render::chapter_index(chapters).as_bytes())
    }

    fn emit_chapter(
        &self,
        ctx: &RunContext,
        ordinal: usize,
        chapter: &Chapter,
        artifact: ChapterArtifact,
    ) -> Result<(), PipelineError> {
        let stem = chapter_file_stem(ordinal, &chapter.title);
        match artifact {
            ChapterArtifact::Markdown(markdown) => {
                let filename = format!("{stem}.md");
                ctx.log(format!("Writing Markdown file: {filename}"));
                self.save(ctx, &filename, markdown.as_bytes())
            }
            ChapterArtifact::QuestionBank(bank) => {
                ctx.log(format!(
                    "Extracted {} questions, writing {stem}.md, {stem}.json and {stem}.pdf",
                    bank.questions.len()
                ));
                let json = serde_json::to_vec_pretty(&bank)
                    .map_err(|e| PipelineError::Render(e.to_string()))?;
                self.save(ctx, &format!("{stem}.md"), render::question_bank_markdown(&bank).as_bytes())?;
                self.save(ctx, &format!("{stem}.json"), &json)?;
                self.save(ctx, &format!("{stem}.pdf"), &render::question_bank_pdf(&bank)?)
            }
        }
    }

    fn save(&self, ctx: &RunContext, filename: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        self.sink.save(filename, bytes)?;
        ctx.record_artifact(filename);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuestionBank, RawChapter};
    use crate::services::slicer::fixtures::pdf_with_pages;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubDetector(Vec<RawChapter>);

    impl ChapterDetector for StubDetector {
        async fn detect(&self, _toc_text: &str) -> Result<Vec<RawChapter>, PipelineError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct StubExtractor {
        fail_on: Option<&'static str>,
        /// chapter title -> page count of the PDF it was given
        seen: Mutex<BTreeMap<String, u32>>,
    }

    impl QuestionExtractor for StubExtractor {
        async fn extract(
            &self,
            chapter_pdf: &[u8],
            request: &ExtractionRequest<'_>,
        ) -> Result<ChapterArtifact, PipelineError> {
            let pages = SourceDocument::load(chapter_pdf)?.page_count();
            self.seen
                .lock()
                .unwrap()
                .insert(request.chapter_title.to_string(), pages);
            if self.fail_on == Some(request.chapter_title) {
                return Err(PipelineError::LlmStatus {
                    status: 400,
                    body: "quota exceeded".into(),
                });
            }
            Ok(match request.format {
                ArtifactFormat::Markdown => ChapterArtifact::Markdown(render::markdown_with_metadata(
                    request.board,
                    request.subject,
                    &format!("### Question 1\n\nFrom {}", request.chapter_title),
                )),
                ArtifactFormat::QuestionBank => ChapterArtifact::QuestionBank(QuestionBank {
                    board: request.board.into(),
                    subject: request.subject.into(),
                    chapter_title: request.chapter_title.into(),
                    questions: Vec::new(),
                }),
            })
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<(String, Vec<u8>)>>>);

    impl MemorySink {
        fn names(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }

        fn text(&self, name: &str) -> String {
            let files = self.0.lock().unwrap();
            let (_, bytes) = files.iter().rev().find(|(n, _)| n == name).unwrap();
            String::from_utf8(bytes.clone()).unwrap()
        }
    }

    impl ArtifactSink for MemorySink {
        fn save(&self, filename: &str, bytes: &[u8]) -> Result<(), PipelineError> {
            self.0.lock().unwrap().push((filename.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    fn three_chapters() -> Vec<RawChapter> {
        vec![
            RawChapter::new("Real Numbers", 2, 8),
            RawChapter::new("Polynomials", 9, 15),
            RawChapter::new("Linear Equations", 16, 30),
        ]
    }

    fn metadata() -> BookMetadata {
        BookMetadata {
            board: "CBSE".into(),
            subject: "Mathematics".into(),
        }
    }

    fn request(format: ArtifactFormat, review: bool) -> RunRequest {
        RunRequest {
            pdf: pdf_with_pages(30),
            metadata: metadata(),
            format,
            review,
        }
    }

    fn pipeline(
        raw: Vec<RawChapter>,
        extractor: StubExtractor,
    ) -> (Chapterizer<StubDetector, StubExtractor, MemorySink>, MemorySink) {
        let sink = MemorySink::default();
        let chapterizer = Chapterizer::new(
            Arc::new(StubDetector(raw)),
            Arc::new(extractor),
            sink.clone(),
            PipelineSettings::default(),
        );
        (chapterizer, sink)
    }

    fn started_context() -> RunContext {
        let ctx = RunContext::new();
        ctx.begin("maths.pdf", metadata()).unwrap();
        ctx
    }

    #[tokio::test]
    async fn processes_every_chapter_in_order() {
        let (chapterizer, sink) = pipeline(three_chapters(), StubExtractor::default());
        let ctx = started_context();

        chapterizer
            .process_book(&ctx, request(ArtifactFormat::Markdown, false))
            .await;

        let status = ctx.snapshot();
        assert_eq!(status.state, RunState::Done, "{:?}", status.log);
        assert_eq!(
            sink.names(),
            vec![
                "chapters.txt",
                "1_Real_Numbers.md",
                "2_Polynomials.md",
                "3_Linear_Equations.md"
            ]
        );
        assert_eq!(
            sink.text("chapters.txt"),
            "Real Numbers: Pages 2 - 8\nPolynomials: Pages 9 - 15\nLinear Equations: Pages 16 - 30"
        );
        assert!(sink.text("2_Polynomials.md").starts_with("---\n**Board:** CBSE\n"));
        assert_eq!(status.artifacts, sink.names());
        assert_eq!(status.chapters.len(), 3);
        assert!(
            status
                .log
                .iter()
                .any(|line| line.ends_with(&format!("(prompt v{PROMPT_VERSION}).")))
        );
    }

    #[tokio::test]
    async fn extractor_receives_exact_page_ranges() {
        let extractor = Arc::new(StubExtractor::default());
        let sink = MemorySink::default();
        let chapterizer = Chapterizer::new(
            Arc::new(StubDetector(three_chapters())),
            extractor.clone(),
            sink,
            PipelineSettings::default(),
        );
        let ctx = started_context();
        chapterizer
            .process_book(&ctx, request(ArtifactFormat::Markdown, false))
            .await;

        let seen = extractor.seen.lock().unwrap();
        assert_eq!(seen.get("Real Numbers"), Some(&7));
        assert_eq!(seen.get("Polynomials"), Some(&7));
        assert_eq!(seen.get("Linear Equations"), Some(&15));
    }

    #[tokio::test]
    async fn failed_extraction_aborts_remaining_chapters() {
        let extractor = StubExtractor {
            fail_on: Some("Polynomials"),
            ..StubExtractor::default()
        };
        let (chapterizer, sink) = pipeline(three_chapters(), extractor);
        let ctx = started_context();

        chapterizer
            .process_book(&ctx, request(ArtifactFormat::Markdown, false))
            .await;

        let status = ctx.snapshot();
        assert_eq!(status.state, RunState::Error);
        assert!(status.error.as_deref().unwrap().contains("quota exceeded"));
        assert_eq!(sink.names(), vec!["chapters.txt", "1_Real_Numbers.md"]);
        assert!(status.log.last().unwrap().contains("ERROR:"));
    }

    #[tokio::test]
    async fn chapter_beyond_document_is_skipped() {
        let raw = vec![
            RawChapter::new("Sets", 2, 10),
            RawChapter::new("Appendix", 40, 52),
            RawChapter::new("Relations", 53, 60),
        ];
        let (chapterizer, sink) = pipeline(raw, StubExtractor::default());
        let ctx = started_context();

        chapterizer
            .process_book(&ctx, request(ArtifactFormat::Markdown, false))
            .await;

        let status = ctx.snapshot();
        assert_eq!(status.state, RunState::Done);
        assert_eq!(sink.names(), vec!["chapters.txt", "1_Sets.md"]);
        assert!(
            status
                .log
                .iter()
                .any(|line| line.ends_with("Skipping Chapter 2 - page range seems invalid or empty."))
        );
    }

    #[tokio::test]
    async fn no_usable_chapters_is_a_run_error() {
        let raw = vec![RawChapter::new("Broken", 0, 0), RawChapter::default()];
        let (chapterizer, sink) = pipeline(raw, StubExtractor::default());
        let ctx = started_context();

        chapterizer
            .process_book(&ctx, request(ArtifactFormat::Markdown, false))
            .await;

        let status = ctx.snapshot();
        assert_eq!(status.state, RunState::Error);
        assert_eq!(
            status.error.as_deref(),
            Some("Could not identify chapters from the book's table of contents.")
        );
        assert!(sink.names().is_empty());
        assert!(status.log.iter().any(|line| line.contains("Skipping chapter candidate 1")));
    }

    #[tokio::test]
    async fn invalid_pdf_is_a_run_error() {
        let (chapterizer, sink) = pipeline(three_chapters(), StubExtractor::default());
        let ctx = started_context();
        let mut bad = request(ArtifactFormat::Markdown, false);
        bad.pdf = b"%PDF-garbage".to_vec();

        chapterizer.process_book(&ctx, bad).await;

        assert_eq!(ctx.state(), RunState::Error);
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn question_bank_emits_markdown_json_and_pdf() {
        let raw = vec![RawChapter::new("Sets", 2, 4)];
        let (chapterizer, sink) = pipeline(raw, StubExtractor::default());
        let ctx = started_context();

        chapterizer
            .process_book(&ctx, request(ArtifactFormat::QuestionBank, false))
            .await;

        assert_eq!(ctx.state(), RunState::Done);
        assert_eq!(
            sink.names(),
            vec!["chapters.txt", "1_Sets.md", "1_Sets.json", "1_Sets.pdf"]
        );
        let json: serde_json::Value = serde_json::from_str(&sink.text("1_Sets.json")).unwrap();
        assert_eq!(json["chapterTitle"], "Sets");
    }

    async fn wait_for_state(ctx: &RunContext, state: RunState) {
        for _ in 0..200 {
            if ctx.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached {state:?}: {:?}", ctx.snapshot().log);
    }

    #[tokio::test]
    async fn reviewed_list_replaces_detected_one() {
        let (chapterizer, sink) = pipeline(three_chapters(), StubExtractor::default());
        let chapterizer = Arc::new(chapterizer);
        let ctx = Arc::new(started_context());

        let task = {
            let (chapterizer, ctx) = (chapterizer.clone(), ctx.clone());
            tokio::spawn(async move {
                chapterizer
                    .process_book(&ctx, request(ArtifactFormat::Markdown, true))
                    .await
            })
        };

        wait_for_state(&ctx, RunState::ReviewingChapters).await;
        ctx.submit_review(vec![
            Chapter::new("Real Numbers", 2, 10),
            Chapter::new("Polynomials", 11, 20),
        ])
        .unwrap();
        task.await.unwrap();

        assert_eq!(ctx.state(), RunState::Done);
        assert_eq!(
            sink.names(),
            vec!["chapters.txt", "chapters.txt", "1_Real_Numbers.md", "2_Polynomials.md"]
        );
        assert_eq!(
            sink.text("chapters.txt"),
            "Real Numbers: Pages 2 - 10\nPolynomials: Pages 11 - 20"
        );
    }

    #[tokio::test]
    async fn cancelling_during_review_stops_the_run() {
        let (chapterizer, sink) = pipeline(three_chapters(), StubExtractor::default());
        let chapterizer = Arc::new(chapterizer);
        let ctx = Arc::new(started_context());

        let task = {
            let (chapterizer, ctx) = (chapterizer.clone(), ctx.clone());
            tokio::spawn(async move {
                chapterizer
                    .process_book(&ctx, request(ArtifactFormat::Markdown, true))
                    .await
            })
        };

        wait_for_state(&ctx, RunState::ReviewingChapters).await;
        ctx.cancel().unwrap();
        task.await.unwrap();

        let status = ctx.snapshot();
        assert_eq!(status.state, RunState::Error);
        assert_eq!(status.error.as_deref(), Some("Run cancelled by user."));
        assert_eq!(sink.names(), vec!["chapters.txt"]);
    }

    #[tokio::test]
    async fn cancel_before_review_is_not_lost() {
        let (chapterizer, sink) = pipeline(three_chapters(), StubExtractor::default());
        let ctx = started_context();
        ctx.cancel().unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            chapterizer.process_book(&ctx, request(ArtifactFormat::Markdown, true)),
        )
        .await
        .expect("cancelled run should not wait for review");

        let status = ctx.snapshot();
        assert_eq!(status.state, RunState::Error);
        assert_eq!(status.error.as_deref(), Some("Run cancelled by user."));
        assert_eq!(sink.names(), vec!["chapters.txt"]);
    }

    #[tokio::test]
    async fn hostile_detector_output_always_ends_the_run() {
        let garbage = |value: serde_json::Value| RawChapter::from_value(value);
        let cases = vec![
            vec![
                garbage(serde_json::json!({ "chapterTitle": "Huge", "startPage": -5, "endPage": 1e30 })),
                RawChapter::new("Sets", 3, 9),
            ],
            vec![
                RawChapter::new("Everything", 1, i64::MAX),
                RawChapter::new("Nothing", i64::MIN, i64::MIN),
            ],
            vec![
                garbage(serde_json::json!("not a chapter")),
                garbage(serde_json::json!({ "chapterTitle": 7, "startPage": [], "endPage": {} })),
                RawChapter::new("Tail", 29, 1_000_000),
                RawChapter::new("Beyond", 4_999, 5_000),
            ],
            Vec::new(),
        ];

        for candidates in cases {
            let (chapterizer, _sink) = pipeline(candidates.clone(), StubExtractor::default());
            let ctx = started_context();
            tokio::time::timeout(
                Duration::from_secs(5),
                chapterizer.process_book(&ctx, request(ArtifactFormat::Markdown, false)),
            )
            .await
            .expect("run should finish");

            let state = ctx.state();
            assert!(
                matches!(state, RunState::Done | RunState::Error),
                "{candidates:?} left the run in {state:?}"
            );
        }
    }
}
