//! CHS geometry approximation for the VHD footer.
//!
//! The values are advisory: every address in this crate is sector-linear. They exist so that
//! tools which still look at CHS see something plausible.

/// Largest sector count the CHS fields can describe (65535 cylinders, 16 heads, 255 spt).
pub const MAX_CHS_SECTORS: u64 = 65535 * 16 * 255;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl Geometry {
    pub fn from_total_sectors(total_sectors: u64) -> Self {
        let total = total_sectors.min(MAX_CHS_SECTORS);

        let (heads, spt) = if total >= 65535 * 16 * 63 {
            (16u64, 255u64)
        } else {
            let mut spt = 17u64;
            let mut heads = total.div_ceil(spt * 1024).max(4);
            if heads > 16 {
                spt = 31;
                heads = 16;
                // Still more than 1024 cylinders at 16 heads.
                if total.div_ceil(spt * 1024) > heads {
                    spt = 63;
                }
            }
            (heads, spt)
        };

        let cylinders = total / (heads * spt);
        Self {
            cylinders: cylinders.min(u64::from(u16::MAX)) as u16,
            heads: heads as u8,
            sectors_per_track: spt as u8,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors_per_track)
    }
}
