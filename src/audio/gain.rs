// ABOUTME: Lock-free volume and mute control for synchronized sinks
// ABOUTME: Atomic gain target plus an exponential smoother applied in the callback

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

struct VolumeState {
    gain_bits: AtomicU32,
    muted: AtomicBool,
    volume_pct: AtomicU8,
}

/// Shared volume/mute handle for a sink.
///
/// All methods are lock-free and safe from any thread; clones share state
/// through a single `Arc`. The audio callback only ever calls
/// [`VolumeControl::gain`].
#[derive(Clone)]
pub struct VolumeControl {
    state: Arc<VolumeState>,
}

/// Clamp to 0-100 and map through a 1.5-power perceptual curve.
fn volume_to_gain(volume: u8) -> (u8, f32) {
    let clamped = volume.min(100);
    (clamped, (f32::from(clamped) / 100.0).powf(1.5))
}

impl VolumeControl {
    /// Create a control at the given volume, unmuted.
    pub fn new(volume: u8) -> Self {
        let (clamped, gain) = volume_to_gain(volume);
        Self {
            state: Arc::new(VolumeState {
                gain_bits: AtomicU32::new(gain.to_bits()),
                muted: AtomicBool::new(false),
                volume_pct: AtomicU8::new(clamped),
            }),
        }
    }

    /// Set playback volume (0-100, clamped). 50 feels like half volume
    /// rather than half amplitude.
    pub fn set_volume(&self, volume: u8) {
        let (clamped, gain) = volume_to_gain(volume);
        self.state.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
        self.state.volume_pct.store(clamped, Ordering::Relaxed);
    }

    /// Mute or unmute; the stored volume is untouched.
    pub fn set_muted(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::Relaxed);
    }

    /// Current volume, 0-100.
    pub fn volume(&self) -> u8 {
        self.state.volume_pct.load(Ordering::Relaxed)
    }

    /// Whether output is muted.
    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Relaxed)
    }

    /// Effective target gain, 0.0-1.0. Zero while muted; non-finite bits
    /// fail safe to silence.
    pub fn gain(&self) -> f32 {
        if self.state.muted.load(Ordering::Relaxed) {
            return 0.0;
        }
        let gain = f32::from_bits(self.state.gain_bits.load(Ordering::Relaxed));
        if !gain.is_finite() {
            return 0.0;
        }
        gain.clamp(0.0, 1.0)
    }
}

impl std::fmt::Debug for VolumeControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeControl")
            .field("volume", &self.volume())
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// One-pole gain smoother living inside the audio callback.
///
/// Instead of scheduling a fixed-length ramp, the applied gain decays
/// exponentially toward whatever target the control reports on each
/// callback, and snaps once the residual is inaudible. The smoother
/// carries no schedule state, so a target that moves mid-transition (a
/// volume drag, a mute during a fade) just bends the curve toward the new
/// value. All samples of a frame get the same gain, keeping the
/// transition shape independent of channel count.
pub(crate) struct GainSmoother {
    /// Per-frame decay applied to the residual toward the target.
    coeff: f32,
    current: f32,
}

impl GainSmoother {
    /// Residual below this snaps to the target (0.2% of full scale).
    const SETTLE_EPSILON: f32 = 2.0e-3;
    /// The residual shrinks by this factor over one settling window.
    const DECAY: f32 = 1.0e-3;

    /// Create a smoother with a ~20ms settling window at the given rate.
    pub(crate) fn new(sample_rate: u32, initial: f32) -> Self {
        let window_frames = (sample_rate as f32 / 50.0).max(1.0);
        Self {
            coeff: 1.0 - Self::DECAY.powf(1.0 / window_frames),
            current: initial.clamp(0.0, 1.0),
        }
    }

    /// Scale an interleaved buffer in place toward `target`.
    pub(crate) fn apply(&mut self, data: &mut [f32], channels: usize, target: f32) {
        if data.is_empty() || channels == 0 || !target.is_finite() {
            return;
        }
        let target = target.clamp(0.0, 1.0);

        // Transition region: step the gain once per frame until it lands.
        let mut index = 0;
        while index + channels <= data.len() && self.current != target {
            self.current += self.coeff * (target - self.current);
            if (self.current - target).abs() < Self::SETTLE_EPSILON {
                self.current = target;
            }
            for sample in &mut data[index..index + channels] {
                *sample *= self.current;
            }
            index += channels;
        }

        // Settled remainder: one constant gain for the rest of the buffer.
        let gain = self.current;
        if gain == 0.0 {
            data[index..].fill(0.0);
        } else if gain != 1.0 {
            for sample in &mut data[index..] {
                *sample *= gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perceptual_curve_endpoints() {
        let control = VolumeControl::new(100);
        assert!((control.gain() - 1.0).abs() < f32::EPSILON);

        control.set_volume(0);
        assert_eq!(control.gain(), 0.0);

        control.set_volume(50);
        let expected = 0.5f32.powf(1.5);
        assert!((control.gain() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_volume_clamps_above_100() {
        let control = VolumeControl::new(100);
        control.set_volume(250);
        assert_eq!(control.volume(), 100);
        assert!((control.gain() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_mute_forces_zero_gain_keeps_volume() {
        let control = VolumeControl::new(100);
        control.set_volume(75);
        let unmuted_gain = control.gain();

        control.set_muted(true);
        assert_eq!(control.gain(), 0.0);
        assert_eq!(control.volume(), 75);

        control.set_muted(false);
        assert!((control.gain() - unmuted_gain).abs() < f32::EPSILON);
    }

    #[test]
    fn test_clones_share_state() {
        let control = VolumeControl::new(100);
        let clone = control.clone();
        control.set_volume(30);
        assert_eq!(clone.volume(), 30);
    }

    #[test]
    fn test_curve_is_monotone() {
        let control = VolumeControl::new(0);
        let mut previous = -1.0f32;
        for volume in 0..=100u8 {
            control.set_volume(volume);
            let gain = control.gain();
            assert!(
                gain > previous || (volume == 0 && gain == 0.0),
                "non-monotone at volume {volume}"
            );
            previous = gain;
        }
    }

    #[test]
    fn test_smoother_approaches_target_monotonically() {
        // 1000Hz sample rate: 20-frame settling window.
        let mut smoother = GainSmoother::new(1_000, 1.0);
        let mut data = vec![1.0f32; 40];
        smoother.apply(&mut data, 1, 0.5);

        let mut settled_at = None;
        for i in 1..40 {
            if data[i] == data[i - 1] {
                settled_at = Some(i);
                break;
            }
            assert!(
                data[i] < data[i - 1],
                "gain should fall strictly until settled, frame {i}"
            );
        }
        assert!(settled_at.is_some(), "smoother should settle inside the buffer");
    }

    #[test]
    fn test_smoother_settles_on_target_within_window() {
        let mut smoother = GainSmoother::new(1_000, 1.0);
        let mut data = vec![1.0f32; 40];
        smoother.apply(&mut data, 1, 0.5);

        // One settling window is 20 frames; everything after must sit
        // exactly on the target.
        for (i, &sample) in data[20..].iter().enumerate() {
            assert!(
                (sample - 0.5).abs() < f32::EPSILON,
                "frame {} should be settled at 0.5, got {sample}",
                i + 20
            );
        }
    }

    #[test]
    fn test_smoother_fade_to_mute_ends_in_exact_silence() {
        let mut smoother = GainSmoother::new(1_000, 1.0);
        let mut data = vec![1.0f32; 40];
        smoother.apply(&mut data, 1, 0.0);

        assert!(data[0] > 0.0, "mute should fade, not hard-cut");
        assert_eq!(&data[20..], &[0.0; 20][..], "settled tail is exact silence");
    }

    #[test]
    fn test_smoother_unity_fast_path_leaves_buffer_untouched() {
        let mut smoother = GainSmoother::new(48_000, 1.0);
        let original = [0.1f32, 0.2, 0.3, 0.4];
        let mut data = original;
        smoother.apply(&mut data, 2, 1.0);
        assert_eq!(data, original);
    }

    #[test]
    fn test_smoother_transition_independent_of_channels() {
        let mut mono_smoother = GainSmoother::new(1_000, 1.0);
        let mut stereo_smoother = GainSmoother::new(1_000, 1.0);
        let mut mono = vec![1.0f32; 20];
        let mut stereo = vec![1.0f32; 40];
        mono_smoother.apply(&mut mono, 1, 0.0);
        stereo_smoother.apply(&mut stereo, 2, 0.0);
        for frame in 0..20 {
            assert!(
                (mono[frame] - stereo[frame * 2]).abs() < 1e-6,
                "frame {frame} gain should match across channel counts"
            );
        }
    }

    #[test]
    fn test_smoother_redirects_mid_transition() {
        let mut smoother = GainSmoother::new(1_000, 1.0);
        // Start fading out, reverse to full volume mid-fade.
        let mut fade_out = vec![1.0f32; 10];
        smoother.apply(&mut fade_out, 1, 0.0);
        let mut fade_in = vec![1.0f32; 80];
        smoother.apply(&mut fade_in, 1, 1.0);

        assert_eq!(
            *fade_in.last().unwrap(),
            1.0,
            "reversed fade should settle back at unity"
        );
        for i in 1..80 {
            assert!(
                fade_in[i] >= fade_in[i - 1],
                "reversed fade should rise, frame {i}"
            );
        }
    }

    #[test]
    fn test_smoother_ignores_non_finite_target() {
        let mut smoother = GainSmoother::new(1_000, 0.5);
        let original = [1.0f32, 1.0, 1.0, 1.0];
        let mut data = original;
        smoother.apply(&mut data, 1, f32::NAN);
        assert_eq!(data, original, "NaN target must not touch the buffer");
    }
}
