//! Mel spectrogram and MFCC computation

use anyhow::Result;
use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

/// Mel spectrogram computer
pub struct MelSpectrogram {
    /// FFT size
    pub n_fft: usize,
    /// Hop length
    pub hop_length: usize,
    /// Window length
    pub win_length: usize,
    /// Number of mel bands
    pub n_mels: usize,
    /// Sample rate
    pub sample_rate: u32,
    /// Minimum frequency
    pub fmin: f32,
    /// Maximum frequency (None = Nyquist)
    pub fmax: Option<f32>,
    /// Reflect-pad by `n_fft / 2` so frame `t` is centered on sample `t * hop`
    pub center: bool,
    /// Mel filterbank
    mel_filters: Vec<Vec<f32>>,
    /// Hann window
    window: Vec<f32>,
}

impl MelSpectrogram {
    /// Create a new mel spectrogram computer
    pub fn new(
        n_fft: usize,
        hop_length: usize,
        win_length: usize,
        n_mels: usize,
        sample_rate: u32,
        fmin: f32,
        fmax: Option<f32>,
    ) -> Self {
        let window = Self::hann_window(win_length);
        let fmax = fmax.unwrap_or(sample_rate as f32 / 2.0);
        let mel_filters = Self::mel_filterbank(n_fft, n_mels, sample_rate, fmin, fmax);

        Self {
            n_fft,
            hop_length,
            win_length,
            n_mels,
            sample_rate,
            fmin,
            fmax: Some(fmax),
            center: true,
            mel_filters,
            window,
        }
    }

    /// Compute the log mel spectrogram, shape (frames, n_mels)
    pub fn compute(&self, audio: &[f32]) -> Result<Vec<Vec<f32>>> {
        let mel_spec = self.compute_power(audio)?;
        Ok(Self::log_compress(&mel_spec))
    }

    /// Mel power spectrogram without compression, shape (frames, n_mels)
    pub fn compute_power(&self, audio: &[f32]) -> Result<Vec<Vec<f32>>> {
        let stft = self.stft(audio)?;
        let power_spec = Self::power_spectrum(&stft);
        Ok(self.apply_mel_filters(&power_spec))
    }

    /// Number of frames produced for `num_samples` input samples
    pub fn num_frames(&self, num_samples: usize) -> usize {
        if self.center {
            num_samples / self.hop_length + 1
        } else {
            num_samples.saturating_sub(self.n_fft) / self.hop_length + 1
        }
    }

    fn padded(&self, audio: &[f32]) -> Vec<f32> {
        if !self.center || audio.len() < 2 {
            return audio.to_vec();
        }
        let pad = self.n_fft / 2;
        let n = audio.len();
        // reflect without repeating the edge sample
        let reflect = |i: isize| -> f32 {
            let period = 2 * (n as isize - 1);
            let mut j = i.rem_euclid(period);
            if j >= n as isize {
                j = period - j;
            }
            audio[j as usize]
        };
        (-(pad as isize)..(n + pad) as isize).map(reflect).collect()
    }

    /// Short-time Fourier transform
    fn stft(&self, audio: &[f32]) -> Result<Vec<Vec<Complex<f32>>>> {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(self.n_fft);

        let padded = self.padded(audio);
        let num_frames = self.num_frames(audio.len());
        let win_offset = (self.n_fft.saturating_sub(self.win_length)) / 2;
        let mut stft_frames = Vec::with_capacity(num_frames);

        for i in 0..num_frames {
            let start = i * self.hop_length;
            let mut frame: Vec<Complex<f32>> = (0..self.n_fft)
                .map(|j| {
                    let sample = padded.get(start + j).copied().unwrap_or(0.0);
                    let window_val = if j >= win_offset && j - win_offset < self.win_length {
                        self.window[j - win_offset]
                    } else {
                        0.0
                    };
                    Complex::new(sample * window_val, 0.0)
                })
                .collect();

            fft.process(&mut frame);
            stft_frames.push(frame[..self.n_fft / 2 + 1].to_vec());
        }

        Ok(stft_frames)
    }

    fn power_spectrum(stft: &[Vec<Complex<f32>>]) -> Vec<Vec<f32>> {
        stft.iter()
            .map(|frame| frame.iter().map(|c| c.norm_sqr()).collect())
            .collect()
    }

    fn apply_mel_filters(&self, power_spec: &[Vec<f32>]) -> Vec<Vec<f32>> {
        power_spec
            .iter()
            .map(|frame| {
                self.mel_filters
                    .iter()
                    .map(|filter| filter.iter().zip(frame.iter()).map(|(f, p)| f * p).sum())
                    .collect()
            })
            .collect()
    }

    fn log_compress(mel_spec: &[Vec<f32>]) -> Vec<Vec<f32>> {
        mel_spec
            .iter()
            .map(|frame| frame.iter().map(|v| v.max(1e-10).ln()).collect())
            .collect()
    }

    /// Periodic Hann window
    fn hann_window(size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / size as f32).cos()))
            .collect()
    }

    fn hz_to_mel(hz: f32) -> f32 {
        2595.0 * (1.0 + hz / 700.0).log10()
    }

    fn mel_to_hz(mel: f32) -> f32 {
        700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0)
    }

    /// Triangular HTK mel filterbank
    fn mel_filterbank(n_fft: usize, n_mels: usize, sr: u32, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
        let n_freqs = n_fft / 2 + 1;
        let freq_bins: Vec<f32> = (0..n_freqs)
            .map(|i| i as f32 * sr as f32 / n_fft as f32)
            .collect();

        let mel_min = Self::hz_to_mel(fmin);
        let mel_max = Self::hz_to_mel(fmax);
        let mel_points: Vec<f32> = (0..n_mels + 2)
            .map(|i| Self::mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32))
            .collect();

        let mut filters = vec![vec![0.0; n_freqs]; n_mels];

        for i in 0..n_mels {
            let left = mel_points[i];
            let center = mel_points[i + 1];
            let right = mel_points[i + 2];

            for (j, &freq) in freq_bins.iter().enumerate() {
                if freq >= left && freq <= center {
                    filters[i][j] = (freq - left) / (center - left);
                } else if freq > center && freq <= right {
                    filters[i][j] = (right - freq) / (right - center);
                }
            }
        }

        filters
    }
}

/// MFCC features: dB-scaled mel power followed by an orthonormal DCT-II
pub struct Mfcc {
    mel: MelSpectrogram,
    n_mfcc: usize,
    top_db: f32,
    /// (n_mfcc, n_mels) DCT matrix
    dct: Vec<Vec<f32>>,
}

impl Mfcc {
    /// MFCC with `n_mels = max(128, n_mfcc)`, `n_fft = 321`, hop 160
    pub fn new(n_mfcc: usize, sample_rate: u32) -> Self {
        let n_mels = n_mfcc.max(128);
        let n_fft = 321;
        let mel = MelSpectrogram::new(n_fft, n_fft / 2, n_fft, n_mels, sample_rate, 0.0, None);
        let dct = Self::dct_matrix(n_mfcc, n_mels);
        Self {
            mel,
            n_mfcc,
            top_db: 80.0,
            dct,
        }
    }

    /// Number of coefficients per frame
    pub fn n_mfcc(&self) -> usize {
        self.n_mfcc
    }

    /// Compute MFCCs, shape (frames, n_mfcc)
    pub fn compute(&self, audio: &[f32]) -> Result<Vec<Vec<f32>>> {
        let power = self.mel.compute_power(audio)?;
        let mut db: Vec<Vec<f32>> = power
            .iter()
            .map(|frame| frame.iter().map(|v| 10.0 * v.max(1e-10).log10()).collect())
            .collect();

        let max_db = db
            .iter()
            .flat_map(|f| f.iter().copied())
            .fold(f32::NEG_INFINITY, f32::max);
        let floor = max_db - self.top_db;
        for frame in db.iter_mut() {
            for v in frame.iter_mut() {
                *v = v.max(floor);
            }
        }

        Ok(db
            .iter()
            .map(|frame| {
                self.dct
                    .iter()
                    .map(|row| row.iter().zip(frame.iter()).map(|(d, v)| d * v).sum())
                    .collect()
            })
            .collect())
    }

    /// Batched MFCC of a (B, 1, L) or (B, L) waveform tensor, output (B, n_mfcc, frames)
    pub fn compute_tensor(&self, audio: &Tensor, device: &Device) -> Result<Tensor> {
        let batch = audio.dim(0)?;
        let flat = audio.flatten_from(1)?.to_dtype(candle_core::DType::F32)?;
        let mut outputs = Vec::with_capacity(batch);
        for b in 0..batch {
            let samples: Vec<f32> = flat.get(b)?.to_vec1()?;
            let coeffs = self.compute(&samples)?;
            let frames = coeffs.len();
            let data: Vec<f32> = coeffs.into_iter().flatten().collect();
            let t = Tensor::from_vec(data, (frames, self.n_mfcc), device)?.t()?;
            outputs.push(t);
        }
        Ok(Tensor::stack(&outputs, 0)?)
    }

    fn dct_matrix(n_mfcc: usize, n_mels: usize) -> Vec<Vec<f32>> {
        (0..n_mfcc)
            .map(|k| {
                let scale = if k == 0 {
                    (1.0 / n_mels as f32).sqrt()
                } else {
                    (2.0 / n_mels as f32).sqrt()
                };
                (0..n_mels)
                    .map(|n| scale * (PI / n_mels as f32 * (n as f32 + 0.5) * k as f32).cos())
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn test_mel_frame_count_centered() {
        let mel = MelSpectrogram::new(400, 160, 400, 40, 16000, 0.0, None);
        let spec = mel.compute(&sine(440.0, 16000)).unwrap();
        assert_eq!(spec.len(), 16000 / 160 + 1);
        assert_eq!(spec[0].len(), 40);
    }

    #[test]
    fn test_mel_peak_band_tracks_frequency() {
        let mel = MelSpectrogram::new(512, 160, 512, 40, 16000, 0.0, None);
        let argmax = |spec: &Vec<Vec<f32>>| {
            let frame = &spec[spec.len() / 2];
            frame
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
                .unwrap()
        };
        let low = argmax(&mel.compute(&sine(300.0, 8000)).unwrap());
        let high = argmax(&mel.compute(&sine(3000.0, 8000)).unwrap());
        assert!(high > low, "3 kHz band {high} should be above 300 Hz band {low}");
    }

    #[test]
    fn test_dct_rows_orthonormal() {
        let dct = Mfcc::dct_matrix(13, 128);
        for i in 0..13 {
            for j in 0..13 {
                let dot: f32 = dct[i].iter().zip(dct[j].iter()).map(|(a, b)| a * b).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dot - expected).abs() < 1e-4, "row {i}.{j} = {dot}");
            }
        }
    }

    #[test]
    fn test_mfcc_tensor_shape() {
        let mfcc = Mfcc::new(13, 16000);
        let audio = Tensor::new(sine(440.0, 3200), &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 3200))
            .unwrap();
        let out = mfcc.compute_tensor(&audio, &Device::Cpu).unwrap();
        assert_eq!(out.dims(), &[1, 13, 3200 / 160 + 1]);
    }
}
