use serde::Deserialize;

/// Hard predicates; a candidate failing any of them is dropped.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub blocked_qualities: Vec<String>,
    pub allowed_qualities: Vec<String>,
    /// Numeric ladder bounds (e.g. 720, 2160).
    pub min_resolution: Option<u32>,
    pub max_resolution: Option<u32>,
    pub allowed_codecs: Vec<String>,
    pub required_audio: Vec<String>,
    pub allowed_audio: Vec<String>,
    /// `"2.0"`, `"5.1"` or `"7.1"`.
    pub min_channels: Option<String>,
    /// At least one of these HDR formats must be present.
    pub required_hdr: Vec<String>,
    pub blocked_hdr: Vec<String>,
    pub allowed_hdr: Vec<String>,
    pub block_sdr: bool,
    pub required_languages: Vec<String>,
    pub allowed_languages: Vec<String>,
    pub require_proper: bool,
    pub allow_repack: bool,
    pub block_cam: bool,
    pub min_size_gb: Option<f64>,
    pub max_size_gb: Option<f64>,
    pub blocked_groups: Vec<String>,
    pub preferred_groups: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocked_qualities: Vec::new(),
            allowed_qualities: Vec::new(),
            min_resolution: None,
            max_resolution: None,
            allowed_codecs: Vec::new(),
            required_audio: Vec::new(),
            allowed_audio: Vec::new(),
            min_channels: None,
            required_hdr: Vec::new(),
            blocked_hdr: Vec::new(),
            allowed_hdr: Vec::new(),
            block_sdr: false,
            required_languages: Vec::new(),
            allowed_languages: Vec::new(),
            require_proper: false,
            allow_repack: true,
            block_cam: true,
            min_size_gb: None,
            max_size_gb: None,
            blocked_groups: Vec::new(),
            preferred_groups: Vec::new(),
        }
    }
}

/// Additive score weights. Keys are matched as lowercase substrings of the
/// release title; first match wins for codec and quality, all matches sum
/// for audio and visual tags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub resolution_4k: i64,
    pub resolution_1080p: i64,
    pub resolution_720p: i64,
    pub resolution_sd: i64,
    pub codec: Vec<(String, i64)>,
    pub audio: Vec<(String, i64)>,
    pub quality: Vec<(String, i64)>,
    /// HDR formats plus the special `"3d"` key matching any 3D variant.
    pub visual: Vec<(String, i64)>,
    pub age_weight: f64,
    pub grab_weight: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            resolution_4k: 400,
            resolution_1080p: 300,
            resolution_720p: 200,
            resolution_sd: 50,
            codec: vec![
                ("x265".to_string(), 60),
                ("hevc".to_string(), 60),
                ("av1".to_string(), 50),
                ("x264".to_string(), 40),
            ],
            audio: vec![
                ("atmos".to_string(), 40),
                ("truehd".to_string(), 30),
                ("dts-hd".to_string(), 25),
                ("dts".to_string(), 15),
                ("ddp".to_string(), 10),
                ("eac3".to_string(), 10),
                ("ac3".to_string(), 5),
            ],
            quality: vec![
                ("remux".to_string(), 120),
                ("bluray".to_string(), 100),
                ("web-dl".to_string(), 80),
                ("webrip".to_string(), 60),
                ("hdtv".to_string(), 30),
                ("dvdrip".to_string(), 10),
            ],
            visual: vec![
                ("dv".to_string(), 30),
                ("hdr10+".to_string(), 25),
                ("hdr10".to_string(), 20),
                ("hdr".to_string(), 15),
                ("3d".to_string(), -50),
            ],
            age_weight: 0.0001,
            grab_weight: 0.1,
        }
    }
}

impl WeightConfig {
    pub fn resolution_weight(&self, bucket: &str) -> i64 {
        match bucket {
            "4k" => self.resolution_4k,
            "1080p" => self.resolution_1080p,
            "720p" => self.resolution_720p,
            _ => self.resolution_sd,
        }
    }
}
