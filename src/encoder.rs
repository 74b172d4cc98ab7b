//! Turns an engine token stream into wire replies.

use futures::{StreamExt, stream::BoxStream};

use crate::{
    error::ServiceError,
    model::GeneratedToken,
    protocol::{Chunk, Reply},
    session::GenerationCycle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Buffer the whole cycle and reply once.
    OneShot,
    /// One chunk per engine token.
    Streaming,
}

/// Encodes one generate cycle. Streaming mode yields chunks ending with
/// exactly one `stop: true` chunk, or a single error; one-shot mode yields
/// exactly one item.
pub fn encode(
    mode: SessionMode,
    cycle: GenerationCycle,
) -> BoxStream<'static, Result<Reply, ServiceError>> {
    match mode {
        SessionMode::Streaming => stream_chunks(cycle)
            .map(|item| item.map(Reply::Chunk))
            .boxed(),
        SessionMode::OneShot => {
            futures::stream::once(async move { collect_outputs(cycle).await.map(Reply::Outputs) })
                .boxed()
        }
    }
}

pub fn stream_chunks(cycle: GenerationCycle) -> BoxStream<'static, Result<Chunk, ServiceError>> {
    let GenerationCycle {
        mut tokens,
        budget,
        stop_sequence,
        slot,
        ..
    } = cycle;

    Box::pin(async_stream::stream! {
        // The slot is held until the cycle's last chunk.
        let _slot = slot;
        let mut encoder = ChunkEncoder::new(stop_sequence, budget);

        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => {
                    let chunk = encoder.encode(token);
                    let stop = chunk.stop;
                    yield Ok::<_, ServiceError>(chunk);
                    if stop {
                        return;
                    }
                }
                Err(err) => {
                    yield Err(ServiceError::Engine(err));
                    return;
                }
            }
        }

        if let Some(chunk) = encoder.finish() {
            yield Ok(chunk);
        }
    })
}

/// Runs the cycle to completion. Partial output is discarded on failure.
pub async fn collect_outputs(cycle: GenerationCycle) -> Result<String, ServiceError> {
    let mut chunks = stream_chunks(cycle);
    let mut outputs = String::new();
    while let Some(chunk) = chunks.next().await {
        outputs.push_str(&chunk?.outputs);
    }
    Ok(outputs)
}

/// Per-cycle chunk state: cumulative token count, budget, stop matching.
pub struct ChunkEncoder {
    matcher: StopMatcher,
    budget: usize,
    token_count: usize,
    finished: bool,
}

impl ChunkEncoder {
    pub fn new(stop_sequence: Option<String>, budget: usize) -> Self {
        Self {
            matcher: StopMatcher::new(stop_sequence),
            budget,
            token_count: 0,
            finished: false,
        }
    }

    pub fn encode(&mut self, token: GeneratedToken) -> Chunk {
        self.token_count += 1;
        let (mut outputs, matched) = self.matcher.push(&token.text);
        let stop = matched || token.is_final || self.token_count >= self.budget;
        if stop && !matched {
            outputs.push_str(&self.matcher.flush());
        }
        self.finished = stop;

        Chunk {
            outputs,
            stop,
            token_count: self.token_count,
        }
    }

    /// Closing chunk for an engine stream that ended without marking its
    /// last token final. `None` if a stop chunk was already produced.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(Chunk {
            outputs: self.matcher.flush(),
            stop: true,
            token_count: self.token_count,
        })
    }
}

/// Stop-sequence detection across token boundaries.
///
/// Text that could still turn out to be the start of the stop sequence is
/// held back until the next token disambiguates it.
#[derive(Debug, Default)]
pub struct StopMatcher {
    stop: Option<String>,
    pending: String,
}

impl StopMatcher {
    pub fn new(stop: Option<String>) -> Self {
        Self {
            stop: stop.filter(|s| !s.is_empty()),
            pending: String::new(),
        }
    }

    /// Returns the text safe to emit and whether the stop sequence was
    /// found. On a match the returned text ends right before the sequence.
    pub fn push(&mut self, text: &str) -> (String, bool) {
        self.pending.push_str(text);
        let Some(stop) = self.stop.as_deref() else {
            return (std::mem::take(&mut self.pending), false);
        };

        if let Some(pos) = self.pending.find(stop) {
            let released = self.pending[..pos].to_string();
            self.pending.clear();
            return (released, true);
        }

        let held_from = self
            .pending
            .char_indices()
            .map(|(idx, _)| idx)
            .find(|&idx| stop.starts_with(&self.pending[idx..]))
            .unwrap_or(self.pending.len());
        let released = self.pending.drain(..held_from).collect();
        (released, false)
    }

    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}
