//! Embedding tools for the text and vision modalities.
//!
//! Both encoders are deterministic and fully local: text is feature-hashed
//! bag-of-words, vision is a byte histogram. Points are content-addressed
//! (`t:<sha>` / `v:<sha>`), so re-embedding identical content upserts the
//! same point. A real encoder swaps in behind the same tool contract.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{Tool, ToolContext};
use crate::store::blobs;
use crate::vector;

/// Text embedding dimensionality.
pub const TEXT_DIMS: usize = 256;
/// Vision embedding dimensionality (one bin per byte value).
pub const VISION_DIMS: usize = 256;

/// Feature-hashed bag-of-words embedding, L2-normalized. The zero vector is
/// returned for token-free text.
pub fn embed_text_vector(text: &str) -> Vec<f32> {
    let mut vec = vec![0.0f32; TEXT_DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = token.to_lowercase();
        let digest = Sha256::digest(token.as_bytes());
        let idx = u16::from_be_bytes([digest[0], digest[1]]) as usize % TEXT_DIMS;
        vec[idx] += 1.0;
    }
    l2_normalize(&mut vec);
    vec
}

fn embed_bytes_histogram(bytes: &[u8]) -> Vec<f32> {
    let mut vec = vec![0.0f32; VISION_DIMS];
    for b in bytes {
        vec[*b as usize] += 1.0;
    }
    l2_normalize(&mut vec);
    vec
}

fn l2_normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Content-addressed point id for a text.
pub fn text_point_id(text: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
    format!("t:{}", &digest[..40])
}

fn bytes_point_id(bytes: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    format!("v:{}", &digest[..40])
}

/// `text_embed({text}) -> {vector_ref}`
pub struct TextEmbedTool;

#[async_trait]
impl Tool for TextEmbedTool {
    fn name(&self) -> &'static str {
        "text_embed"
    }

    fn description(&self) -> &'static str {
        "Embed text into the text vector index"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to embed" }
            },
            "required": ["text"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "vector_ref": { "type": "string" },
                "dims": { "type": "integer" }
            },
            "required": ["vector_ref"]
        })
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let text = inputs
            .get("text")
            .and_then(|t| t.as_str())
            .context("text must be a string")?;

        let vec = embed_text_vector(text);
        let point_id = text_point_id(text);
        vector::upsert_point(&ctx.pool, &point_id, "text", &vec).await?;

        Ok(json!({
            "vector_ref": point_id,
            "dims": TEXT_DIMS,
        }))
    }
}

/// `vision_embed({blob_id}) -> {vector_ref}`
pub struct VisionEmbedTool;

#[async_trait]
impl Tool for VisionEmbedTool {
    fn name(&self) -> &'static str {
        "vision_embed"
    }

    fn description(&self) -> &'static str {
        "Embed an image blob into the vision vector index"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "blob_id": { "type": "string", "description": "Image blob" }
            },
            "required": ["blob_id"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "vector_ref": { "type": "string" },
                "dims": { "type": "integer" }
            },
            "required": ["vector_ref"]
        })
    }

    fn timeout_ms(&self) -> u64 {
        15_000
    }

    async fn execute(&self, inputs: Value, ctx: &ToolContext) -> Result<Value> {
        let blob_id = inputs
            .get("blob_id")
            .and_then(|b| b.as_str())
            .context("blob_id must be a string")?;
        let blob = blobs::get(&ctx.pool, blob_id)
            .await?
            .with_context(|| format!("blob not found: {}", blob_id))?;

        // vision_mode = "local" is the encoder seam; without a bundled
        // model it degrades to the deterministic histogram.
        if ctx.config.tools.vision_mode == "local" {
            tracing::debug!("vision_mode=local but no encoder bundled, using histogram");
        }
        let bytes = tokio::fs::read(&blob.path)
            .await
            .with_context(|| format!("reading {}", blob.path))?;
        let vec = embed_bytes_histogram(&bytes);
        let point_id = bytes_point_id(&bytes);
        vector::upsert_point(&ctx.pool, &point_id, "vision", &vec).await?;

        Ok(json!({
            "vector_ref": point_id,
            "dims": VISION_DIMS,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[test]
    fn embedding_is_deterministic_and_normalized() {
        let a = embed_text_vector("EchoGarden is a knowledge garden");
        let b = embed_text_vector("EchoGarden is a knowledge garden");
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_tokens_give_positive_similarity() {
        let doc = embed_text_vector("EchoGarden is a local-first knowledge garden.");
        let query = embed_text_vector("knowledge garden");
        let unrelated = embed_text_vector("quantum chromodynamics lattice");

        let hit = cosine_similarity(&query, &doc);
        let miss = cosine_similarity(&unrelated, &doc);
        assert!(hit > 0.3, "expected overlap, got {hit}");
        assert!(hit > miss);
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let v = embed_text_vector("   \n\t ");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn point_ids_are_content_addressed() {
        assert_eq!(text_point_id("abc"), text_point_id("abc"));
        assert_ne!(text_point_id("abc"), text_point_id("abd"));
        assert!(text_point_id("abc").starts_with("t:"));
    }
}
