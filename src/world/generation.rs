use crate::{
    prelude::*,
    world::{block::BlockValue, registry::BlockRegistry, section::Section},
};
use noise::{Fbm, NoiseFn, Seedable};

/// Hook for producing section content where no file exists. While a
/// generator is running for a section, the section sits in the `Generating`
/// load state and the streaming scheduler leaves it alone.
pub trait WorldGenerator: Send {
    /// Whether this generator has content for the given section.
    fn can_generate(&self, sx: i32, sy: i32) -> bool;

    /// The block-Z range generated content may occupy; the world derives the
    /// section's initial chunk-Z range from it.
    fn z_range(&self, sx: i32, sy: i32) -> (i32, i32);

    /// Fills a freshly created section with blocks. Chunks are created
    /// through `Section::create_chunk` so availability stays consistent, and
    /// LODs are rebuilt before returning.
    fn generate_into(&self, section: &mut Section, palette: &BlockRegistry) -> Result<()>;
}

/// Default fbm-heightmap generator: a thin crust of surface blocks over a
/// few blocks of fill.
pub struct NoiseGenerator {
    heightmap: Fbm,
    surface_block: BlockValue,
    fill_block: BlockValue,
    amplitude: f64,
    scale: f64,
    crust_depth: i32,
}

impl NoiseGenerator {
    pub fn new(seed: u32, surface_block: BlockValue, fill_block: BlockValue) -> Self {
        Self {
            heightmap: Fbm::new().set_seed(seed),
            surface_block,
            fill_block,
            amplitude: 24.0,
            scale: 0.01,
            crust_depth: 3,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    fn surface_height(&self, bx: i32, by: i32) -> i32 {
        let sample = self
            .heightmap
            .get([bx as f64 * self.scale, by as f64 * self.scale]);
        (sample * self.amplitude) as i32
    }
}

impl WorldGenerator for NoiseGenerator {
    fn can_generate(&self, _sx: i32, _sy: i32) -> bool {
        true
    }

    fn z_range(&self, _sx: i32, _sy: i32) -> (i32, i32) {
        let swing = self.amplitude.abs().ceil() as i32;
        (-swing - self.crust_depth, swing + 1)
    }

    fn generate_into(&self, section: &mut Section, palette: &BlockRegistry) -> Result<()> {
        if palette.get(self.surface_block).is_none() || palette.get(self.fill_block).is_none() {
            bail!("generator block values missing from palette");
        }

        let chunk_size = section.chunk_size() as i32;
        let section_blocks = section.section_size() as i32 * chunk_size;
        let base_bx = section.base_chunk_x() * chunk_size;
        let base_by = section.base_chunk_y() * chunk_size;

        for local_y in 0..section_blocks {
            for local_x in 0..section_blocks {
                let height = self.surface_height(base_bx + local_x, base_by + local_y);
                let (rx, lx) = (local_x / chunk_size, local_x % chunk_size);
                let (ry, ly) = (local_y / chunk_size, local_y % chunk_size);

                for bz in (height - self.crust_depth)..=height {
                    let cz = crate::util::floor_div(bz, chunk_size);
                    let lz = crate::util::floor_rem(bz, chunk_size);
                    if section.chunk(rx as u32, ry as u32, cz).is_none() {
                        section.create_chunk(rx as u32, ry as u32, cz);
                    }
                    let value = if bz == height {
                        self.surface_block
                    } else {
                        self.fill_block
                    };
                    let chunk = section
                        .chunk_mut(rx as u32, ry as u32, cz)
                        .expect("chunk created above");
                    chunk.set_block(0, lx as u32, ly as u32, lz as u32, value);
                }
            }
        }

        section.rebuild_lods();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{block, registry::test_palette, section::Section};

    fn section_for(generator: &NoiseGenerator, sx: i32, sy: i32) -> Section {
        let (min_bz, max_bz) = generator.z_range(sx, sy);
        let min_cz = crate::util::floor_div(min_bz, 16);
        let max_cz = crate::util::floor_div(max_bz, 16);
        Section::create(16, 2, 2, sx, sy, min_cz, max_cz)
    }

    #[test]
    fn generated_section_has_a_continuous_surface() {
        let palette = test_palette::build();
        let generator = NoiseGenerator::new(7, test_palette::STONE, test_palette::STONE);
        let mut section = section_for(&generator, 0, 0);
        generator.generate_into(&mut section, &palette).unwrap();

        assert!(section.chunk_count() > 0);

        let chunk_size = 16i32;
        for local in [(0i32, 0i32), (5, 9), (31, 31)] {
            let height = generator.surface_height(local.0, local.1);
            let cz = crate::util::floor_div(height, chunk_size);
            let chunk = section
                .chunk(
                    (local.0 / chunk_size) as u32,
                    (local.1 / chunk_size) as u32,
                    cz,
                )
                .expect("surface chunk exists");
            let lz = crate::util::floor_rem(height, chunk_size);
            assert_eq!(
                chunk.block(
                    0,
                    (local.0 % chunk_size) as u32,
                    (local.1 % chunk_size) as u32,
                    lz as u32
                ),
                test_palette::STONE
            );

            if lz + 1 < chunk_size {
                assert_eq!(
                    chunk.block(
                        0,
                        (local.0 % chunk_size) as u32,
                        (local.1 % chunk_size) as u32,
                        (lz + 1) as u32
                    ),
                    block::AIR
                );
            }
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let palette = test_palette::build();
        let make = || {
            let generator = NoiseGenerator::new(42, test_palette::STONE, test_palette::STONE);
            let mut section = section_for(&generator, 1, -1);
            generator.generate_into(&mut section, &palette).unwrap();
            section
        };

        let a = make();
        let b = make();
        assert_eq!(a.chunk_count(), b.chunk_count());
        for (chunk_a, chunk_b) in a.chunks().zip(b.chunks()) {
            assert_eq!(chunk_a.values(0), chunk_b.values(0));
        }
    }

    #[test]
    fn rejects_unknown_palette_blocks() {
        let palette = test_palette::build();
        let generator = NoiseGenerator::new(1, 999, 999);
        let mut section = Section::create(8, 2, 1, 0, 0, -1, 1);
        assert!(generator.generate_into(&mut section, &palette).is_err());
    }
}
