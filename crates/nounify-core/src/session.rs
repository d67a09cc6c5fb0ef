use crate::metadata::NftMetadata;

/// Arguments for the contract write, derived at mint time and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MintRequest {
    pub recipient: String,
    pub uri: String,
}

/// In-memory state for one session: the preview list, the selection, and
/// the generation counter used to drop stale pipeline results.
///
/// Selection is tracked by image URL value, not index. Two candidates
/// sharing an image URL would make it ambiguous; kept as-is. A new
/// generation replaces the preview list without touching the selection, so
/// a stale selection simply stops matching any entry.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    previews: Vec<NftMetadata>,
    active_image: Option<String>,
    latest_generation: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the token for a new generation run. Results may only be
    /// applied while their token is still the latest issued one.
    pub fn begin_generation(&mut self) -> u64 {
        self.latest_generation += 1;
        self.latest_generation
    }

    pub fn latest_generation(&self) -> u64 {
        self.latest_generation
    }

    /// Replaces the preview list wholesale if `token` belongs to the latest
    /// run; returns false (dropping the results) otherwise.
    pub fn apply_previews(&mut self, token: u64, previews: Vec<NftMetadata>) -> bool {
        if token != self.latest_generation {
            return false;
        }
        self.previews = previews;
        true
    }

    pub fn previews(&self) -> &[NftMetadata] {
        self.previews.as_slice()
    }

    /// Marks the candidate with this image URL active. Re-selecting the
    /// same URL is a no-op; URLs absent from the preview list are still
    /// recorded.
    pub fn select(&mut self, image_url: &str) {
        if self.active_image.as_deref() == Some(image_url) {
            return;
        }
        self.active_image = Some(image_url.to_string());
    }

    pub fn active_image(&self) -> Option<&str> {
        self.active_image.as_deref()
    }

    /// The preview entry the selection currently matches, if any.
    pub fn selected(&self) -> Option<&NftMetadata> {
        let active = self.active_image.as_deref()?;
        self.previews.iter().find(|entry| entry.image == active)
    }

    /// Mint arguments for the current selection. An unmatched or absent
    /// selection yields an empty URI; whether that is mintable is the
    /// contract's call, not this layer's.
    pub fn mint_request(&self, recipient: &str) -> MintRequest {
        MintRequest {
            recipient: recipient.to_string(),
            uri: self
                .selected()
                .map(|entry| entry.uri.clone())
                .unwrap_or_default(),
        }
    }
}
