use sha2::{Digest as _, Sha256};

use crate::{
    Error, FlashRegion,
    digest::{Digest, DigestEngine},
    image::{ImageMetadata, ImageVerifier, VerifyMode},
};

/// SHA-256 engine counting how it is used.
pub struct CountingEngine {
    pub begins: usize,
    pub bytes: usize,
    exhausted: bool,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self {
            begins: 0,
            bytes: 0,
            exhausted: false,
        }
    }

    /// Engine that never hands out a context.
    pub fn exhausted() -> Self {
        Self {
            exhausted: true,
            ..Self::new()
        }
    }
}

impl DigestEngine for CountingEngine {
    type Context = Sha256;

    fn begin(&mut self) -> Option<Sha256> {
        if self.exhausted {
            return None;
        }
        self.begins += 1;
        Some(Sha256::new())
    }

    fn update(&mut self, context: &mut Sha256, data: &[u8]) {
        self.bytes += data.len();
        context.update(data);
    }

    fn finish(&mut self, context: Sha256) -> Digest {
        context.finalize().into()
    }
}

/// Image verifier returning a fixed outcome.
pub struct ScriptedVerifier {
    outcome: Result<ImageMetadata, Error>,
    pub calls: usize,
    pub last_mode: Option<VerifyMode>,
}

impl ScriptedVerifier {
    pub fn accepting(metadata: ImageMetadata) -> Self {
        Self {
            outcome: Ok(metadata),
            calls: 0,
            last_mode: None,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            outcome: Err(Error::ImageInvalid),
            calls: 0,
            last_mode: None,
        }
    }
}

impl ImageVerifier for ScriptedVerifier {
    async fn verify(
        &mut self,
        _part: FlashRegion,
        mode: VerifyMode,
    ) -> Result<ImageMetadata, Error> {
        self.calls += 1;
        self.last_mode = Some(mode);
        self.outcome
    }
}
