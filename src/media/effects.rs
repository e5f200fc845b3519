//! Audio filter chain construction (spec.md §4.2.3).
//!
//! The teacher never reprocesses audio on the hot path (it forwards RTP
//! directly in `voice/sfu.rs`), so this has no teacher counterpart; it is
//! built fresh from spec.md's effect-config table and passed to the decoder
//! subprocess as a single `-af` filtergraph string, each stage comma
//! separated as spec.md describes.

use crate::config::EffectConfig;

/// Builds the comma-joined filtergraph, or `None` if every stage is a
/// no-op (the decoder is then spawned without `-af` at all).
pub fn build_filter_chain(effect: &EffectConfig) -> Option<String> {
    let mut stages = Vec::new();

    if let Some(semitones) = effect.pitch {
        // atempo only accepts [0.5, 100.0]; map semitones to a tempo
        // multiplier via the equal-tempered ratio, approximating pitch
        // shift without a resampler stage.
        let ratio = 2f32.powf(semitones / 12.0);
        stages.push(format!("atempo={:.4}", ratio.clamp(0.5, 2.0)));
    }

    if let Some(strength) = effect.reverb {
        let strength = strength.clamp(0.0, 1.0);
        let decay = 0.3 + strength * 0.5;
        stages.push(format!(
            "aecho=0.8:0.9:{}:{:.2}",
            (40.0 + strength * 200.0) as u32,
            decay
        ));
    }

    if let Some(amount) = effect.distortion {
        let amount = amount.clamp(0.0, 1.0);
        stages.push(format!(
            "acompressor=threshold={:.2}:ratio={:.1}:attack=5:release=50",
            0.5 - amount * 0.4,
            2.0 + amount * 18.0
        ));
    }

    if effect.echo {
        stages.push("aecho=0.8:0.88:60:0.4".to_string());
    }

    if effect.tremolo {
        stages.push("tremolo=f=5:d=0.6".to_string());
    }

    if effect.robot {
        // Preset spectral transform: ring-modulator-like flat pitch + comb.
        stages.push("afftfilt=real='hypot(re,im)':imag='0'".to_string());
        stages.push("flanger=delay=0:depth=2:regen=0".to_string());
    }

    if effect.alien {
        stages.push("asetrate=48000*1.3,atempo=0.77".to_string());
        stages.push("chorus=0.6:0.9:55:0.4:0.25:2".to_string());
    }

    if stages.is_empty() {
        None
    } else {
        Some(stages.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_effects_yields_no_filter_chain() {
        assert!(build_filter_chain(&EffectConfig::default()).is_none());
    }

    #[test]
    fn robot_preset_produces_a_chain() {
        let effect = EffectConfig::from_preset("robot");
        let chain = build_filter_chain(&effect).unwrap();
        assert!(chain.contains("afftfilt"));
    }

    #[test]
    fn multiple_stages_are_comma_joined() {
        let effect = EffectConfig {
            echo: true,
            tremolo: true,
            ..Default::default()
        };
        let chain = build_filter_chain(&effect).unwrap();
        assert_eq!(chain.split(',').count(), 2);
    }
}
