#[derive(Debug, Clone, Copy)]
pub struct HashEmbedderConfig {
    pub dimensions: usize,
    pub seed: u64,
}

impl Default for HashEmbedderConfig {
    fn default() -> Self {
        Self {
            dimensions: 256,
            seed: 1337,
        }
    }
}

/// Offline embedder using signed feature hashing over lowercase word tokens.
///
/// Buckets come from BLAKE3 rather than `DefaultHasher`, so vectors are stable
/// across processes, platforms and toolchain upgrades. A persisted index built
/// with this embedder stays comparable with fresh query vectors.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    config: HashEmbedderConfig,
}

impl HashEmbedder {
    pub fn new(config: HashEmbedderConfig) -> Self {
        Self { config }
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions.max(1)
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let dims = self.dimensions();
        let mut vector = vec![0f32; dims];
        for token in tokenize(text) {
            let (bucket, sign) = self.bucket_for(&token, dims);
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, token: &str, dims: usize) -> (usize, f32) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.config.seed.to_le_bytes());
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let bucket = (u64::from_le_bytes(head) % dims as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}
