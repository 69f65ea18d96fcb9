//! Batched, retrying text→vector calls. Batches are capped at 96 inputs or
//! 6 000 cumulative characters, whichever fires first, and results preserve
//! input order. The provider's embedding dimension is discovered from the
//! first returned vector and cached on the Repository by the pipeline.

use serde::Deserialize;

use super::client::{send_with_retries, LLM_CALL_TIMEOUT};
use super::{gemini, LlmContext, LlmError};

/// Maximum inputs per provider call.
const MAX_BATCH_INPUTS: usize = 96;
/// Maximum cumulative characters per provider call.
const MAX_BATCH_CHARS: usize = 6_000;
/// Per-text character ceiling, kept under typical embedding context windows.
const MAX_EMBED_CHARS: usize = 3_000;

/// Embed a list of texts, preserving order.
pub async fn embed(
    client: &reqwest::Client,
    ctx: &LlmContext,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, LlmError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let truncated: Vec<String> = texts
        .iter()
        .map(|t| truncate_for_embedding(t, MAX_EMBED_CHARS).to_string())
        .collect();

    let mut all = Vec::with_capacity(texts.len());
    for batch in split_batches(&truncated) {
        let vectors = if ctx.provider.is_openai_compatible() {
            embed_openai(client, ctx, batch).await?
        } else {
            gemini::embed_batch(client, ctx, batch).await?
        };
        if vectors.len() != batch.len() {
            return Err(LlmError::Failure(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        all.extend(vectors);
    }

    Ok(all)
}

/// Embed a single text.
pub async fn embed_single(
    client: &reqwest::Client,
    ctx: &LlmContext,
    text: &str,
) -> Result<Vec<f32>, LlmError> {
    let mut vectors = embed(client, ctx, &[text.to_string()]).await?;
    vectors
        .pop()
        .ok_or_else(|| LlmError::Failure("no embedding returned".into()))
}

/// Split texts into contiguous batches respecting both caps. Every batch is
/// non-empty: an oversized single text still goes out alone.
fn split_batches(texts: &[String]) -> Vec<&[String]> {
    let mut batches = Vec::new();
    let mut start = 0usize;
    let mut chars = 0usize;

    for (i, text) in texts.iter().enumerate() {
        let len = text.chars().count();
        let at_cap = i - start >= MAX_BATCH_INPUTS || (i > start && chars + len > MAX_BATCH_CHARS);
        if at_cap {
            batches.push(&texts[start..i]);
            start = i;
            chars = 0;
        }
        chars += len;
    }
    if start < texts.len() {
        batches.push(&texts[start..]);
    }

    batches
}

/// Truncate to a char budget on a UTF-8 boundary.
fn truncate_for_embedding(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

async fn embed_openai(
    client: &reqwest::Client,
    ctx: &LlmContext,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, LlmError> {
    let url = format!("{}/embeddings", ctx.provider.base_url());
    let body = serde_json::json!({
        "model": ctx.model,
        "input": texts,
    });

    let resp = send_with_retries(|| {
        client
            .post(&url)
            .timeout(LLM_CALL_TIMEOUT)
            .header("Authorization", format!("Bearer {}", ctx.api_key))
            .json(&body)
    })
    .await?;

    #[derive(Deserialize)]
    struct EmbedResponse {
        data: Vec<EmbedData>,
    }
    #[derive(Deserialize)]
    struct EmbedData {
        index: usize,
        embedding: Vec<f32>,
    }

    let body: EmbedResponse = resp
        .json()
        .await
        .map_err(|e| LlmError::Failure(format!("failed to parse embeddings: {e}")))?;

    // The protocol allows out-of-order data entries; reorder by index.
    let mut data = body.data;
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(specs: &[usize]) -> Vec<String> {
        specs.iter().map(|n| "a".repeat(*n)).collect()
    }

    #[test]
    fn test_split_empty() {
        assert!(split_batches(&[]).is_empty());
    }

    #[test]
    fn test_split_single_batch() {
        let t = texts(&[100, 100, 100]);
        let batches = split_batches(&t);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn test_split_by_char_cap() {
        // 3 texts of 2500 chars: 2500+2500 > 6000 at the third, so [2][1]
        let t = texts(&[2_500, 2_500, 2_500]);
        let batches = split_batches(&t);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_split_by_input_cap() {
        let t = texts(&vec![1; 200]);
        let batches = split_batches(&t);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), MAX_BATCH_INPUTS);
        assert_eq!(batches[1].len(), MAX_BATCH_INPUTS);
        assert_eq!(batches[2].len(), 200 - 2 * MAX_BATCH_INPUTS);
    }

    #[test]
    fn test_split_oversized_single_text() {
        let t = texts(&[10_000]);
        let batches = split_batches(&t);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn test_split_preserves_order_and_coverage() {
        let t: Vec<String> = (0..250).map(|i| format!("text-{i}")).collect();
        let batches = split_batches(&t);
        let rejoined: Vec<String> = batches.iter().flat_map(|b| b.iter().cloned()).collect();
        assert_eq!(rejoined, t);
    }

    #[test]
    fn test_truncate_short() {
        assert_eq!(truncate_for_embedding("short", 100), "short");
    }

    #[test]
    fn test_truncate_respects_utf8_boundary() {
        let text = "é".repeat(100); // 2 bytes each
        let result = truncate_for_embedding(&text, 151);
        assert!(result.len() <= 151);
        assert!(result.is_char_boundary(result.len()));
    }
}
