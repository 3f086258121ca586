//! Slot matching: raw uploads to declared slots, with confidence grading.
//!
//! Matching tiers, strongest first:
//!
//! 1. **basename_exact**: `<basename>.<ext>`, high confidence;
//! 2. **basename_prefix**: `<basename>...`, medium;
//! 3. **key_prefix**: `<slot key>...`, low, with a
//!    `PHOTO_LOW_CONFIDENCE_MATCH` warning.
//!
//! Two or more candidates at a slot's best tier are tie-broken by the
//! contract's `prefer_order` (then filename, for determinism) and recorded as
//! `PHOTO_DUPLICATE_AUTO_SELECTED`. A single file matching two slots at the
//! same tier is declined for both (`PHOTO_AMBIGUOUS_MATCH`); those slots fall
//! through to the override path.
//!
//! An OCR probe can promote a medium match to high when the slot declares
//! `verify_keywords` and the probe text contains one of them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::contract::{FieldContract, SlotSpec};
use crate::runlog::{
    MatchConfidence, RunRecordBuilder, WARN_PHOTO_AMBIGUOUS_MATCH,
    WARN_PHOTO_DUPLICATE_AUTO_SELECTED, WARN_PHOTO_LOW_CONFIDENCE,
};

/// Which rule matched a file to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchTier {
    BasenameExact,
    BasenamePrefix,
    KeyPrefix,
}

impl MatchTier {
    /// Wire form used in `photo_processing[].matched_by`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BasenameExact => "basename_exact",
            Self::BasenamePrefix => "basename_prefix",
            Self::KeyPrefix => "key_prefix",
        }
    }

    const fn base_confidence(self) -> MatchConfidence {
        match self {
            Self::BasenameExact => MatchConfidence::High,
            Self::BasenamePrefix => MatchConfidence::Medium,
            Self::KeyPrefix => MatchConfidence::Low,
        }
    }
}

/// A slot's selected file with its grading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMatch {
    pub path: PathBuf,
    pub tier: MatchTier,
    pub confidence: MatchConfidence,
    pub ocr_verified: bool,
}

/// Matches every declared slot against the files in `raw_dir`.
///
/// `ocr_text` maps raw filenames to OCR probe output, used only for slots
/// that declare `verify_keywords`. Returns the selection per slot key; slots
/// with no (surviving) candidate are absent from the map.
#[must_use]
pub fn match_slots(
    contract: &FieldContract,
    raw_dir: &Path,
    ocr_text: &BTreeMap<String, String>,
    log: &mut RunRecordBuilder,
) -> BTreeMap<String, SlotMatch> {
    let photos = contract.photos();
    let files = list_candidate_files(raw_dir, &photos.allowed_extensions);

    // Per slot: candidates at that slot's best tier.
    let mut per_slot: BTreeMap<String, (MatchTier, Vec<PathBuf>)> = BTreeMap::new();
    for slot in &photos.slots {
        let mut best: Option<(MatchTier, Vec<PathBuf>)> = None;
        for file in &files {
            let Some(tier) = match_tier(slot, file) else {
                continue;
            };
            match &mut best {
                Some((best_tier, paths)) => {
                    if tier < *best_tier {
                        *best_tier = tier;
                        paths.clear();
                        paths.push(file.clone());
                    } else if tier == *best_tier {
                        paths.push(file.clone());
                    }
                }
                None => best = Some((tier, vec![file.clone()])),
            }
        }
        if let Some(found) = best {
            per_slot.insert(slot.key.clone(), found);
        }
    }

    drop_cross_slot_ambiguities(&mut per_slot, log);

    let mut selections = BTreeMap::new();
    for slot in &photos.slots {
        let Some((tier, candidates)) = per_slot.get(&slot.key) else {
            continue;
        };
        if candidates.is_empty() {
            continue;
        }
        let chosen = select_candidate(&slot.key, *tier, candidates, &photos.prefer_order, log);
        let graded = grade(slot, *tier, chosen, ocr_text, log);
        selections.insert(slot.key.clone(), graded);
    }
    selections
}

fn list_candidate_files(raw_dir: &Path, allowed_extensions: &[String]) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(raw_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            let ext = p
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e.to_lowercase()))
                .unwrap_or_default();
            allowed_extensions.iter().any(|a| a.to_lowercase() == ext)
        })
        .collect();
    files.sort();
    files
}

fn match_tier(slot: &SlotSpec, file: &Path) -> Option<MatchTier> {
    let stem = file.file_stem()?.to_str()?.to_lowercase();
    let basename = slot.basename.to_lowercase();
    let key = slot.key.to_lowercase();
    if stem == basename {
        Some(MatchTier::BasenameExact)
    } else if stem.starts_with(&basename) {
        Some(MatchTier::BasenamePrefix)
    } else if stem.starts_with(&key) {
        Some(MatchTier::KeyPrefix)
    } else {
        None
    }
}

/// Removes any file claimed by two slots at the same tier from both claims.
fn drop_cross_slot_ambiguities(
    per_slot: &mut BTreeMap<String, (MatchTier, Vec<PathBuf>)>,
    log: &mut RunRecordBuilder,
) {
    let mut claims: BTreeMap<PathBuf, Vec<(String, MatchTier)>> = BTreeMap::new();
    for (slot_key, (tier, paths)) in per_slot.iter() {
        for path in paths {
            claims
                .entry(path.clone())
                .or_default()
                .push((slot_key.clone(), *tier));
        }
    }

    for (path, claimants) in claims {
        let Some((_, first_tier)) = claimants.first() else {
            continue;
        };
        let same_tier: Vec<&(String, MatchTier)> = claimants
            .iter()
            .filter(|(_, tier)| tier == first_tier)
            .collect();
        if same_tier.len() < 2 {
            continue;
        }
        let slots: Vec<String> = same_tier.iter().map(|(key, _)| key.clone()).collect();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        log.warn(
            WARN_PHOTO_AMBIGUOUS_MATCH,
            "photo_match",
            &slots.join(","),
            format!("file matches {} slots at the same tier; declined", slots.len()),
            Some(filename),
            None,
        );
        for (slot_key, _) in &claimants {
            if let Some((_, paths)) = per_slot.get_mut(slot_key) {
                paths.retain(|p| p != &path);
            }
        }
    }
}

fn select_candidate(
    slot_key: &str,
    tier: MatchTier,
    candidates: &[PathBuf],
    prefer_order: &[String],
    log: &mut RunRecordBuilder,
) -> PathBuf {
    if candidates.len() == 1 {
        return candidates[0].clone();
    }

    let rank = |path: &PathBuf| {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        prefer_order
            .iter()
            .position(|p| p.to_lowercase() == ext)
            .unwrap_or(prefer_order.len())
    };
    let mut ordered: Vec<PathBuf> = candidates.to_vec();
    ordered.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
    let chosen = ordered[0].clone();

    let names: Vec<String> = candidates
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    log.warn(
        WARN_PHOTO_DUPLICATE_AUTO_SELECTED,
        &format!("photo_select_{slot_key}"),
        slot_key,
        format!("{} candidates at tier {}", candidates.len(), tier.as_str()),
        Some(names.join(", ")),
        chosen
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
    );
    chosen
}

fn grade(
    slot: &SlotSpec,
    tier: MatchTier,
    path: PathBuf,
    ocr_text: &BTreeMap<String, String>,
    log: &mut RunRecordBuilder,
) -> SlotMatch {
    let mut confidence = tier.base_confidence();
    let mut ocr_verified = false;

    if !slot.verify_keywords.is_empty() {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(text) = ocr_text.get(&filename) {
            let lowered = text.to_lowercase();
            if slot
                .verify_keywords
                .iter()
                .any(|k| lowered.contains(&k.to_lowercase()))
            {
                ocr_verified = true;
                if confidence == MatchConfidence::Medium {
                    confidence = MatchConfidence::High;
                }
            }
        }
    }

    if confidence == MatchConfidence::Low {
        log.warn(
            WARN_PHOTO_LOW_CONFIDENCE,
            &format!("photo_select_{}", slot.key),
            &slot.key,
            "matched by slot-key prefix only; confirm the filename",
            path.file_name().map(|n| n.to_string_lossy().into_owned()),
            None,
        );
    }

    SlotMatch {
        path,
        tier,
        confidence,
        ocr_verified,
    }
}
