//! Embeddings — lazily creates one embedding context per instance.

use lg_domain::stream::Usage;
use lg_domain::Result;
use lg_runtime::ContextParams;

use crate::instance::Instance;
use crate::requests::{EmbeddingRequest, EmbeddingResult};

pub(crate) async fn run_embedding(
    instance: &mut Instance,
    req: &EmbeddingRequest,
) -> Result<EmbeddingResult> {
    if instance.embedding_context.is_none() {
        let params = ContextParams {
            context_size: instance.config.context_size,
            seed: None,
            cpu_threads: instance.config.engine.cpu_threads,
            batch_size: instance.config.engine.batch_size,
        };
        let context = instance.model.create_embedding_context(&params).await?;
        instance.embedding_context = Some(context);
    }
    let Some(context) = instance.embedding_context.as_mut() else {
        return Err(lg_domain::Error::ContextCreation(
            "embedding context unavailable".into(),
        ));
    };

    let mut embeddings = Vec::new();
    let mut input_tokens: u32 = 0;
    for value in &req.inputs {
        // Non-string inputs are dropped silently.
        let Some(text) = value.as_str() else { continue };
        let embedding = context.embed(text).await?;
        input_tokens += embedding.input_tokens;
        embeddings.push(embedding.vector);
    }

    Ok(EmbeddingResult {
        embeddings,
        usage: Usage::new(input_tokens, 0),
    })
}
