use std::sync::Arc;
use tracing::debug;

use crate::db::TranscriptStore;
use crate::error::StoreError;
use crate::Transcript;

/// Answers whether a media item has already been transcribed.
///
/// Transcripts are keyed by media id only, so a hit may come from another
/// user's request for the same media.
#[derive(Clone)]
pub struct CacheChecker {
    transcripts: Arc<dyn TranscriptStore>,
}

impl CacheChecker {
    pub fn new(transcripts: Arc<dyn TranscriptStore>) -> Self {
        CacheChecker { transcripts }
    }

    pub async fn has_result(&self, media_id: &str) -> Result<Option<Transcript>, StoreError> {
        let found = self.transcripts.find_by_media(media_id).await?;
        if let Some(transcript) = &found {
            debug!(media_id, transcript_id = %transcript.id, "Cache hit");
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn reports_stored_transcript() {
        let store = Arc::new(MemoryStore::new());
        let cache = CacheChecker::new(store.clone());
        assert!(cache.has_result("abc").await.unwrap().is_none());

        let body = serde_json::from_str(r#"{"text":"hi there"}"#).unwrap();
        let stored = store.save(&Transcript::from_body("abc", &body)).await.unwrap();

        let hit = cache.has_result("abc").await.unwrap().unwrap();
        assert_eq!(hit.id, stored.id);
        assert!(cache.has_result("other").await.unwrap().is_none());
    }
}
