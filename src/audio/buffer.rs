//! Chunk accumulation for outbound audio
//!
//! Capture delivers planar blocks of whatever size the device picks. The
//! backend wants fixed-size interleaved chunks, so blocks are interleaved into
//! a preallocated buffer and a copy is emitted each time it fills.

/// One scheduling tick of capture: one sample slice per channel
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    channels: &'a [&'a [f32]],
}

impl<'a> AudioBlock<'a> {
    pub fn new(channels: &'a [&'a [f32]]) -> Self {
        Self { channels }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Samples per channel (length of the first channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Sample at `frame` for `channel`.
    ///
    /// Channels missing from the block read channel 0, which turns a mono
    /// source into identical left and right samples.
    #[inline]
    fn sample(&self, channel: usize, frame: usize) -> f32 {
        let source = self.channels.get(channel).unwrap_or(&self.channels[0]);
        source.get(frame).copied().unwrap_or(0.0)
    }
}

/// A full interleaved chunk ready for transmission
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub samples: Vec<f32>,
    pub channels: u16,
}

impl Chunk {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }
}

/// Interleaves capture blocks into fixed-size chunks
pub struct ChunkAccumulator {
    buffer: Vec<f32>,
    write_offset: usize,
    channels: u16,
    chunks_emitted: u64,
}

impl ChunkAccumulator {
    /// `buffer_size` is samples per channel; capacity is `buffer_size * channels`
    pub fn new(buffer_size: usize, channels: u16) -> Self {
        let capacity = buffer_size.max(1) * channels.max(1) as usize;
        Self {
            buffer: vec![0.0; capacity],
            write_offset: 0,
            channels: channels.max(1),
            chunks_emitted: 0,
        }
    }

    /// Append a block, returning every chunk it completed
    pub fn ingest(&mut self, block: Option<&AudioBlock<'_>>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        self.ingest_with(block, |chunk| chunks.push(chunk));
        chunks
    }

    /// Append a block, handing each completed chunk to `emit` as it fills
    pub fn ingest_with(&mut self, block: Option<&AudioBlock<'_>>, mut emit: impl FnMut(Chunk)) {
        let block = match block {
            Some(b) if b.channel_count() > 0 && !b.is_empty() => b,
            _ => return,
        };

        let capacity = self.buffer.len();
        for frame in 0..block.frames() {
            for channel in 0..self.channels as usize {
                self.buffer[self.write_offset] = block.sample(channel, frame);
                self.write_offset += 1;
            }

            if self.write_offset >= capacity {
                emit(Chunk {
                    samples: self.buffer.clone(),
                    channels: self.channels,
                });
                self.chunks_emitted += 1;
                self.write_offset = 0;
            }
        }
    }

    /// Drop any partially filled chunk
    pub fn reset(&mut self) {
        self.write_offset = 0;
    }

    /// Samples buffered towards the next chunk
    pub fn pending(&self) -> usize {
        self.write_offset
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(start: usize, len: usize) -> Vec<f32> {
        (start..start + len).map(|v| v as f32).collect()
    }

    #[test]
    fn test_interleaves_stereo() {
        let mut acc = ChunkAccumulator::new(2, 2);
        let left = [1.0, 3.0];
        let right = [2.0, 4.0];
        let channels: [&[f32]; 2] = [&left, &right];

        let chunks = acc.ingest(Some(&AudioBlock::new(&channels)));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(chunks[0].frames(), 2);
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_no_partial_emission() {
        let mut acc = ChunkAccumulator::new(4, 2);
        let data = [0.5; 3];
        let channels: [&[f32]; 2] = [&data, &data];

        assert!(acc.ingest(Some(&AudioBlock::new(&channels))).is_empty());
        assert_eq!(acc.pending(), 6);

        let chunks = acc.ingest(Some(&AudioBlock::new(&channels)));
        assert_eq!(chunks.len(), 1);
        assert_eq!(acc.pending(), 4);
    }

    #[test]
    fn test_empty_and_absent_blocks() {
        let mut acc = ChunkAccumulator::new(4, 2);
        assert!(acc.ingest(None).is_empty());

        let none: [&[f32]; 0] = [];
        assert!(acc.ingest(Some(&AudioBlock::new(&none))).is_empty());

        let empty: [f32; 0] = [];
        let channels: [&[f32]; 2] = [&empty, &empty];
        assert!(acc.ingest(Some(&AudioBlock::new(&channels))).is_empty());
        assert_eq!(acc.pending(), 0);
    }

    #[test]
    fn test_mono_source_duplicated() {
        let mut acc = ChunkAccumulator::new(2, 2);
        let mono = [0.25, 0.75];
        let channels: [&[f32]; 1] = [&mono];

        let chunks = acc.ingest(Some(&AudioBlock::new(&channels)));
        assert_eq!(chunks[0].samples, vec![0.25, 0.25, 0.75, 0.75]);
    }

    #[test]
    fn test_extra_source_channels_ignored() {
        let mut acc = ChunkAccumulator::new(2, 1);
        let a = [1.0, 2.0];
        let b = [9.0, 9.0];
        let channels: [&[f32]; 2] = [&a, &b];

        let chunks = acc.ingest(Some(&AudioBlock::new(&channels)));
        assert_eq!(chunks[0].samples, vec![1.0, 2.0]);
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut acc = ChunkAccumulator::new(4, 1);
        let data = ramp(0, 3);
        let channels: [&[f32]; 1] = [&data];
        acc.ingest(Some(&AudioBlock::new(&channels)));
        acc.reset();

        let data = ramp(10, 4);
        let channels: [&[f32]; 1] = [&data];
        let chunks = acc.ingest(Some(&AudioBlock::new(&channels)));
        assert_eq!(chunks[0].samples, ramp(10, 4));
    }

    proptest! {
        #[test]
        fn prop_emits_k_full_chunks_in_order(
            buffer_size in 1usize..64,
            channels in 1u16..4,
            k in 0usize..5,
            block_sizes in proptest::collection::vec(1usize..50, 1..20),
        ) {
            let total_frames = k * buffer_size;
            let ch = channels as usize;
            // Channel c of frame f carries the interleaved index f * ch + c.
            let planar: Vec<Vec<f32>> = (0..ch)
                .map(|c| (0..total_frames).map(|f| (f * ch + c) as f32).collect())
                .collect();

            let mut acc = ChunkAccumulator::new(buffer_size, channels);
            let mut emitted = Vec::new();
            let mut frame = 0;
            let mut sizes = block_sizes.iter().cycle();
            while frame < total_frames {
                let len = (*sizes.next().unwrap()).min(total_frames - frame);
                let slices: Vec<&[f32]> = planar.iter().map(|p| &p[frame..frame + len]).collect();
                emitted.extend(acc.ingest(Some(&AudioBlock::new(&slices))));
                frame += len;
            }

            prop_assert_eq!(emitted.len(), k);
            prop_assert_eq!(acc.pending(), 0);
            let flat: Vec<f32> = emitted.iter().flat_map(|c| c.samples.iter().copied()).collect();
            for chunk in &emitted {
                prop_assert_eq!(chunk.samples.len(), buffer_size * ch);
            }
            let expected: Vec<f32> = (0..total_frames * ch).map(|v| v as f32).collect();
            prop_assert_eq!(flat, expected);
        }
    }
}
