//! Master playlist post-processing (spec §4.5): codec fixup, HD/SD
//! variant filtering, and per-language default-track selection.

use m3u8_rs::{AlternativeMedia, MasterPlaylist};

/// Injected when a variant's encoder omitted `CODECS` (the default codec
/// string for an H.264/AAC pipeline).
const DEFAULT_CODECS: &str = "avc1.640828,mp4a.40.2";

/// Minimum pixel width considered HD for `filter_hd_resolutions`.
const HD_MIN_WIDTH: u64 = 1280;

/// Fills in a default `CODECS` attribute on any variant that's missing one,
/// so downstream players that require it (notably Safari) don't reject the
/// playlist outright.
pub fn fixup_codec_information(master: &mut MasterPlaylist) {
    for variant in &mut master.variants {
        if variant.codecs.is_none() {
            variant.codecs = Some(DEFAULT_CODECS.to_string());
        }
    }
}

/// Returns a copy of `master` containing only variants at or above
/// `HD_MIN_WIDTH`. Variants with no declared resolution are kept, since
/// we can't classify them either way.
pub fn filter_hd_resolutions(master: &MasterPlaylist) -> MasterPlaylist {
    let mut filtered = master.clone();
    filtered.variants.retain(|v| match &v.resolution {
        Some(res) => res.width >= HD_MIN_WIDTH,
        None => true,
    });
    filtered
}

/// Returns a copy of `master` containing only variants below
/// `HD_MIN_WIDTH`.
pub fn filter_sd_resolutions(master: &MasterPlaylist) -> MasterPlaylist {
    let mut filtered = master.clone();
    filtered.variants.retain(|v| match &v.resolution {
        Some(res) => res.width < HD_MIN_WIDTH,
        None => false,
    });
    filtered
}

/// For a multi-language master, produces one master per language with that
/// language's audio track marked `DEFAULT=YES` and every other language's
/// turned off (spec §9 open question 2: clone-per-language rather than
/// mutate-then-revert, so concurrent renders never observe a half-flipped
/// master). Keyed `<language>_hd` / `<language>_sd`.
///
/// The "hd" masters carry every variant, unfiltered; "sd" masters are only
/// produced, and only carry the sub-`HD_MIN_WIDTH` variants, if at least one
/// such variant exists - a stream with nothing but HD renditions gets no sd
/// master at all, rather than one with every variant filtered out.
pub fn generate_language_masters(master: &MasterPlaylist) -> Vec<(String, MasterPlaylist)> {
    let languages: Vec<String> = master
        .alternatives
        .iter()
        .filter_map(|alt| alt.language.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let sd = filter_sd_resolutions(master);
    let has_sd = !sd.variants.is_empty();

    let mut out = Vec::new();
    for language in &languages {
        let mut hd_master = master.clone();
        set_default_language(&mut hd_master.alternatives, language);
        out.push((format!("{language}_hd"), hd_master));
    }
    if has_sd {
        for language in &languages {
            let mut sd_master = sd.clone();
            set_default_language(&mut sd_master.alternatives, language);
            out.push((format!("{language}_sd"), sd_master));
        }
    }
    out
}

fn set_default_language(alternatives: &mut [AlternativeMedia], language: &str) {
    for alt in alternatives.iter_mut() {
        alt.default = alt.language.as_deref() == Some(language);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m3u8_rs::{Resolution, VariantStream};

    fn variant(width: u64) -> VariantStream {
        VariantStream {
            uri: format!("{width}.m3u8"),
            bandwidth: 1_000_000,
            resolution: Some(Resolution { width, height: width * 9 / 16 }),
            ..Default::default()
        }
    }

    #[test]
    fn fixup_codec_information_only_touches_missing_codecs() {
        let mut master = MasterPlaylist { variants: vec![variant(1920)], ..Default::default() };
        master.variants[0].codecs = None;
        fixup_codec_information(&mut master);
        assert_eq!(master.variants[0].codecs.as_deref(), Some(DEFAULT_CODECS));
    }

    #[test]
    fn filter_hd_resolutions_keeps_only_wide_variants() {
        let master = MasterPlaylist { variants: vec![variant(1920), variant(640)], ..Default::default() };
        let hd = filter_hd_resolutions(&master);
        assert_eq!(hd.variants.len(), 1);
        assert_eq!(hd.variants[0].resolution.as_ref().unwrap().width, 1920);
    }

    #[test]
    fn generate_language_masters_sets_default_per_language() {
        let master = MasterPlaylist {
            variants: vec![variant(1920)],
            alternatives: vec![
                AlternativeMedia {
                    language: Some("en".to_string()),
                    default: true,
                    ..Default::default()
                },
                AlternativeMedia {
                    language: Some("de".to_string()),
                    default: false,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let masters = generate_language_masters(&master);
        let de_hd = masters.iter().find(|(name, _)| name == "de_hd").unwrap();
        let de_alt = de_hd.1.alternatives.iter().find(|a| a.language.as_deref() == Some("de")).unwrap();
        let en_alt = de_hd.1.alternatives.iter().find(|a| a.language.as_deref() == Some("en")).unwrap();
        assert!(de_alt.default);
        assert!(!en_alt.default);
    }
}
