//! Print DNA: deterministic geometric fingerprints of models plus an
//! append-only history of print outcomes.
//!
//! The fingerprint pairs a sha256 of the file bytes with a geometric
//! signature derived from rounded mesh properties, so re-exports of the
//! same geometry still match even when the bytes differ. Outcome rows feed
//! settings prediction and per-model success rates.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use kiln_store::{KilnDb, PrintDnaRow};

use crate::{now_ts, EngineError, EngineResult};

/// Geometric fingerprint of an STL model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFingerprint {
    /// sha256 of the raw file bytes.
    pub file_hash: String,
    /// Digest of rounded geometric properties; stable across re-exports.
    pub geometric_signature: String,
    pub triangle_count: usize,
    /// Bounding box in mm.
    pub bbox_mm: (f64, f64, f64),
    pub volume_mm3: f64,
    pub surface_area_mm2: f64,
}

/// Aggregated settings recommendation for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsPrediction {
    pub confidence: f64,
    /// `exact_match`, `similar_geometry` or `no_data`.
    pub source: String,
    pub sample_count: usize,
    pub success_rate: f64,
    pub recommended_settings: Map<String, Value>,
}

type Vec3 = (f64, f64, f64);

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    (a.0 - b.0, a.1 - b.1, a.2 - b.2)
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    (
        a.1 * b.2 - a.2 * b.1,
        a.2 * b.0 - a.0 * b.2,
        a.0 * b.1 - a.1 * b.0,
    )
}

fn norm(v: Vec3) -> f64 {
    (v.0 * v.0 + v.1 * v.1 + v.2 * v.2).sqrt()
}

fn triangle_area(v0: Vec3, v1: Vec3, v2: Vec3) -> f64 {
    norm(cross(sub(v1, v0), sub(v2, v0))) / 2.0
}

/// Signed volume of the tetrahedron (origin, v0, v1, v2).
fn signed_volume(v0: Vec3, v1: Vec3, v2: Vec3) -> f64 {
    let c = cross(v1, v2);
    (v0.0 * c.0 + v0.1 * c.1 + v0.2 * c.2) / 6.0
}

fn read_f32(data: &[u8], offset: usize) -> Option<f64> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(f64::from(f32::from_le_bytes(bytes)))
}

/// Parse a binary STL into triangles (each three vertices).
fn parse_binary_stl(data: &[u8]) -> EngineResult<Vec<[Vec3; 3]>> {
    if data.len() < 84 {
        return Err(EngineError::Validation("binary STL shorter than its header".into()));
    }
    let count = u32::from_le_bytes([data[80], data[81], data[82], data[83]]) as usize;
    let expected = 84 + count * 50;
    if data.len() < expected {
        return Err(EngineError::Validation(format!(
            "binary STL truncated: {count} triangles declared, {} bytes present",
            data.len()
        )));
    }
    let mut triangles = Vec::with_capacity(count);
    for i in 0..count {
        // 50-byte records: normal (12), three vertices (36), attribute (2).
        let base = 84 + i * 50 + 12;
        let mut verts = [(0.0, 0.0, 0.0); 3];
        for (v, vert) in verts.iter_mut().enumerate() {
            let off = base + v * 12;
            *vert = (
                read_f32(data, off).unwrap_or(0.0),
                read_f32(data, off + 4).unwrap_or(0.0),
                read_f32(data, off + 8).unwrap_or(0.0),
            );
        }
        triangles.push(verts);
    }
    Ok(triangles)
}

/// Parse an ASCII STL into triangles.
fn parse_ascii_stl(text: &str) -> EngineResult<Vec<[Vec3; 3]>> {
    let mut triangles = Vec::new();
    let mut current: Vec<Vec3> = Vec::with_capacity(3);
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("vertex") {
            let coords: Vec<f64> = rest
                .split_whitespace()
                .filter_map(|tok| tok.parse().ok())
                .collect();
            if coords.len() == 3 {
                current.push((coords[0], coords[1], coords[2]));
            }
        } else if line.starts_with("endfacet") {
            if current.len() == 3 {
                triangles.push([current[0], current[1], current[2]]);
            }
            current.clear();
        }
    }
    if triangles.is_empty() {
        return Err(EngineError::Validation("ASCII STL contains no facets".into()));
    }
    Ok(triangles)
}

fn parse_stl(data: &[u8]) -> EngineResult<Vec<[Vec3; 3]>> {
    // ASCII files start with "solid", but so do some binary exports; trust
    // the binary structure when it is self-consistent.
    if data.len() >= 84 {
        let count = u32::from_le_bytes([data[80], data[81], data[82], data[83]]) as usize;
        if data.len() == 84 + count * 50 && count > 0 {
            return parse_binary_stl(data);
        }
    }
    match std::str::from_utf8(data) {
        Ok(text) if text.trim_start().starts_with("solid") => parse_ascii_stl(text),
        _ => parse_binary_stl(data),
    }
}

/// Fingerprint raw STL bytes.
pub fn fingerprint_bytes(data: &[u8]) -> EngineResult<ModelFingerprint> {
    let file_hash = hex::encode(Sha256::digest(data));
    let triangles = parse_stl(data)?;

    let mut min = (f64::MAX, f64::MAX, f64::MAX);
    let mut max = (f64::MIN, f64::MIN, f64::MIN);
    let mut surface_area = 0.0;
    let mut volume = 0.0;
    for [v0, v1, v2] in &triangles {
        for v in [v0, v1, v2] {
            min = (min.0.min(v.0), min.1.min(v.1), min.2.min(v.2));
            max = (max.0.max(v.0), max.1.max(v.1), max.2.max(v.2));
        }
        surface_area += triangle_area(*v0, *v1, *v2);
        volume += signed_volume(*v0, *v1, *v2);
    }
    let bbox = (max.0 - min.0, max.1 - min.1, max.2 - min.2);
    let volume = volume.abs();

    // Round before hashing so slicer re-exports with float jitter still
    // produce the same signature.
    let signature_input = format!(
        "{}|{:.1}x{:.1}x{:.1}|{:.0}|{:.0}",
        triangles.len(),
        bbox.0,
        bbox.1,
        bbox.2,
        volume,
        surface_area,
    );
    let geometric_signature = hex::encode(&Sha256::digest(signature_input.as_bytes())[..16]);

    Ok(ModelFingerprint {
        file_hash,
        geometric_signature,
        triangle_count: triangles.len(),
        bbox_mm: bbox,
        volume_mm3: volume,
        surface_area_mm2: surface_area,
    })
}

/// Fingerprint an STL file on disk.
pub fn fingerprint_model(path: &Path) -> EngineResult<ModelFingerprint> {
    let data = std::fs::read(path)
        .map_err(|err| EngineError::Validation(format!("cannot read {}: {err}", path.display())))?;
    fingerprint_bytes(&data)
}

/// Outcome parameters for [`PrintDna::record_outcome`].
#[derive(Debug, Clone)]
pub struct PrintOutcome {
    pub printer_model: String,
    pub material: String,
    pub settings: Map<String, Value>,
    /// `success` or `failure`.
    pub outcome: String,
    pub quality_grade: Option<String>,
    pub failure_mode: Option<String>,
    pub print_time_s: Option<f64>,
}

/// Append-only learning history over the durable store.
pub struct PrintDna {
    db: Arc<KilnDb>,
}

impl PrintDna {
    pub fn new(db: Arc<KilnDb>) -> Self {
        Self { db }
    }

    /// Record one print attempt for a fingerprinted model.
    pub fn record_outcome(
        &self,
        fingerprint: &ModelFingerprint,
        outcome: PrintOutcome,
    ) -> EngineResult<i64> {
        let row = PrintDnaRow {
            file_hash: fingerprint.file_hash.clone(),
            geometric_signature: fingerprint.geometric_signature.clone(),
            triangle_count: fingerprint.triangle_count as i64,
            bbox_mm: fingerprint.bbox_mm,
            volume_mm3: fingerprint.volume_mm3,
            surface_area_mm2: fingerprint.surface_area_mm2,
            printer_model: outcome.printer_model,
            material: outcome.material,
            settings: outcome.settings,
            outcome: outcome.outcome,
            quality_grade: outcome.quality_grade,
            failure_mode: outcome.failure_mode,
            print_time_s: outcome.print_time_s,
            timestamp: now_ts(),
        };
        Ok(self.db.insert_print_dna(&row)?)
    }

    /// Full history for a model, newest first.
    pub fn model_history(&self, file_hash: &str) -> EngineResult<Vec<PrintDnaRow>> {
        Ok(self.db.print_dna_by_hash(file_hash, 200)?)
    }

    /// Success rate for a model, optionally restricted to one material.
    /// Returns `(rate, samples)`; no samples yields `None`.
    pub fn success_rate(
        &self,
        file_hash: &str,
        material: Option<&str>,
    ) -> EngineResult<Option<(f64, usize)>> {
        let rows = self.db.print_dna_by_hash(file_hash, 500)?;
        let relevant: Vec<&PrintDnaRow> = rows
            .iter()
            .filter(|r| material.map_or(true, |m| r.material.eq_ignore_ascii_case(m)))
            .collect();
        if relevant.is_empty() {
            return Ok(None);
        }
        let successes = relevant.iter().filter(|r| r.outcome == "success").count();
        Ok(Some((
            successes as f64 / relevant.len() as f64,
            relevant.len(),
        )))
    }

    /// Predict settings for a model: exact file-hash history first, then
    /// rows sharing the geometric signature, else no data.
    pub fn predict_settings(
        &self,
        fingerprint: &ModelFingerprint,
        material: &str,
    ) -> EngineResult<SettingsPrediction> {
        let exact = self.db.print_dna_by_hash(&fingerprint.file_hash, 100)?;
        let exact: Vec<PrintDnaRow> = exact
            .into_iter()
            .filter(|r| r.material.eq_ignore_ascii_case(material))
            .collect();
        if !exact.is_empty() {
            return Ok(aggregate_prediction(&exact, "exact_match"));
        }

        let similar = self
            .db
            .print_dna_by_signature(&fingerprint.geometric_signature, 100)?;
        let similar: Vec<PrintDnaRow> = similar
            .into_iter()
            .filter(|r| r.material.eq_ignore_ascii_case(material))
            .collect();
        if !similar.is_empty() {
            return Ok(aggregate_prediction(&similar, "similar_geometry"));
        }

        Ok(SettingsPrediction {
            confidence: 0.0,
            source: "no_data".into(),
            sample_count: 0,
            success_rate: 0.0,
            recommended_settings: Map::new(),
        })
    }
}

/// Aggregate the settings of successful rows; numeric values are averaged,
/// everything else takes the most recent successful value.
fn aggregate_prediction(rows: &[PrintDnaRow], source: &str) -> SettingsPrediction {
    let successes: Vec<&PrintDnaRow> = rows.iter().filter(|r| r.outcome == "success").collect();
    let success_rate = successes.len() as f64 / rows.len() as f64;

    let mut recommended = Map::new();
    let reference: &[&PrintDnaRow] = if successes.is_empty() { &[] } else { &successes };
    if let Some(latest) = reference.first() {
        for (key, value) in &latest.settings {
            if value.is_number() {
                let values: Vec<f64> = reference
                    .iter()
                    .filter_map(|r| r.settings.get(key).and_then(Value::as_f64))
                    .collect();
                if !values.is_empty() {
                    let avg = values.iter().sum::<f64>() / values.len() as f64;
                    recommended.insert(key.clone(), Value::from((avg * 100.0).round() / 100.0));
                    continue;
                }
            }
            recommended.insert(key.clone(), value.clone());
        }
    }

    // Confidence scales with samples and the observed success rate; an
    // exact match is worth more than a geometry cousin.
    let base = if source == "exact_match" { 1.0 } else { 0.7 };
    let sample_factor = (rows.len() as f64 / 5.0).min(1.0);
    SettingsPrediction {
        confidence: ((base * sample_factor * success_rate) * 100.0).round() / 100.0,
        source: source.into(),
        sample_count: rows.len(),
        success_rate,
        recommended_settings: recommended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A unit cube as ASCII STL (12 triangles).
    const CUBE_ASCII: &str = include_str!("testdata/cube.stl");

    fn cube_binary() -> Vec<u8> {
        // Rebuild the cube as binary STL from the ASCII triangles.
        let triangles = parse_ascii_stl(CUBE_ASCII).unwrap();
        let mut data = vec![0u8; 80];
        data.extend_from_slice(&(triangles.len() as u32).to_le_bytes());
        for tri in &triangles {
            data.extend_from_slice(&[0u8; 12]); // normal
            for v in tri {
                for coord in [v.0, v.1, v.2] {
                    data.extend_from_slice(&(coord as f32).to_le_bytes());
                }
            }
            data.extend_from_slice(&[0u8; 2]); // attribute
        }
        data
    }

    fn db() -> Arc<KilnDb> {
        Arc::new(KilnDb::open_in_memory().unwrap())
    }

    fn outcome(result: &str) -> PrintOutcome {
        let mut settings = Map::new();
        settings.insert("hotend_temp".into(), json!(210.0));
        settings.insert("speed_mm_s".into(), json!(60.0));
        settings.insert("supports".into(), json!(false));
        PrintOutcome {
            printer_model: "voron-2.4".into(),
            material: "PLA".into(),
            settings,
            outcome: result.into(),
            quality_grade: (result == "success").then(|| "A".to_string()),
            failure_mode: (result == "failure").then(|| "warping".to_string()),
            print_time_s: Some(3600.0),
        }
    }

    #[test]
    fn ascii_cube_parses_with_expected_geometry() {
        let fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        assert_eq!(fp.triangle_count, 12);
        assert!((fp.bbox_mm.0 - 10.0).abs() < 1e-6);
        assert!((fp.volume_mm3 - 1000.0).abs() < 1.0);
        assert!((fp.surface_area_mm2 - 600.0).abs() < 1.0);
    }

    #[test]
    fn binary_and_ascii_exports_share_a_signature() {
        let ascii_fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        let binary_fp = fingerprint_bytes(&cube_binary()).unwrap();
        // Different bytes, different file hashes…
        assert_ne!(ascii_fp.file_hash, binary_fp.file_hash);
        // …same geometry, same signature.
        assert_eq!(ascii_fp.geometric_signature, binary_fp.geometric_signature);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        let b = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        assert_eq!(a.file_hash, b.file_hash);
        assert_eq!(a.geometric_signature, b.geometric_signature);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(fingerprint_bytes(b"not an stl at all").is_err());
    }

    #[test]
    fn outcome_history_round_trips() {
        let dna = PrintDna::new(db());
        let fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        dna.record_outcome(&fp, outcome("success")).unwrap();
        dna.record_outcome(&fp, outcome("failure")).unwrap();

        let history = dna.model_history(&fp.file_hash).unwrap();
        assert_eq!(history.len(), 2);
        let rate = dna.success_rate(&fp.file_hash, Some("PLA")).unwrap().unwrap();
        assert_eq!(rate, (0.5, 2));
        assert!(dna.success_rate("missing", None).unwrap().is_none());
    }

    #[test]
    fn prediction_prefers_exact_match() {
        let dna = PrintDna::new(db());
        let fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        for _ in 0..3 {
            dna.record_outcome(&fp, outcome("success")).unwrap();
        }

        let prediction = dna.predict_settings(&fp, "PLA").unwrap();
        assert_eq!(prediction.source, "exact_match");
        assert_eq!(prediction.sample_count, 3);
        assert_eq!(prediction.success_rate, 1.0);
        assert_eq!(prediction.recommended_settings["hotend_temp"], json!(210.0));
        assert!(prediction.confidence > 0.0);
    }

    #[test]
    fn prediction_falls_back_to_similar_geometry() {
        let dna = PrintDna::new(db());
        // History recorded under the binary export…
        let binary_fp = fingerprint_bytes(&cube_binary()).unwrap();
        dna.record_outcome(&binary_fp, outcome("success")).unwrap();

        // …queried with the ASCII export of the same geometry.
        let ascii_fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        let prediction = dna.predict_settings(&ascii_fp, "PLA").unwrap();
        assert_eq!(prediction.source, "similar_geometry");
        assert_eq!(prediction.sample_count, 1);
    }

    #[test]
    fn prediction_with_no_history() {
        let dna = PrintDna::new(db());
        let fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        let prediction = dna.predict_settings(&fp, "PLA").unwrap();
        assert_eq!(prediction.source, "no_data");
        assert_eq!(prediction.confidence, 0.0);
    }

    #[test]
    fn prediction_is_material_scoped() {
        let dna = PrintDna::new(db());
        let fp = fingerprint_bytes(CUBE_ASCII.as_bytes()).unwrap();
        dna.record_outcome(&fp, outcome("success")).unwrap();
        let prediction = dna.predict_settings(&fp, "ABS").unwrap();
        assert_eq!(prediction.source, "no_data");
    }
}
