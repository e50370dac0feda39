use crate::checksum::checksum;
use crate::sprs::{decode_sprs, encode_sprs};
use crate::util::{be_u32, be_u64};
use crate::vhd::BAT_UNALLOCATED;
use crate::{
    decode_vhd, encode_dynamic_vhd, DecodeOptions, DynamicVhdConfig, ImageSource, MemBackend,
    NoProgress, SECTOR_SIZE,
};
use proptest::prelude::*;
use std::num::NonZeroUsize;

const MAX_SECTORS: u64 = 96;

#[derive(Debug, Clone)]
struct Image {
    data: Vec<u8>,
}

fn image_strategy() -> impl Strategy<Value = Image> {
    (1u64..=MAX_SECTORS).prop_flat_map(|sectors| {
        let pokes = prop::collection::vec((0..sectors, 0usize..SECTOR_SIZE, 1u8..=255), 0..12);
        (Just(sectors), pokes).prop_map(|(sectors, pokes)| {
            let mut data = vec![0u8; sectors as usize * SECTOR_SIZE];
            for (lba, within, value) in pokes {
                data[lba as usize * SECTOR_SIZE + within] = value;
            }
            Image { data }
        })
    })
}

fn block_size_strategy() -> impl Strategy<Value = u32> {
    // Small blocks keep fixtures tiny while still producing multi-block disks.
    prop_oneof![Just(512u32), Just(1024u32), Just(4096u32), Just(8192u32)]
}

fn encode(data: &[u8], block_size_bytes: u32, threads: usize) -> Vec<u8> {
    let source = ImageSource::flat(MemBackend::from_vec(data.to_vec())).unwrap();
    let config = DynamicVhdConfig {
        block_size_bytes,
        scan_threads: NonZeroUsize::new(threads).unwrap(),
        ..Default::default()
    };
    let mut out = Vec::new();
    encode_dynamic_vhd(&source, &mut out, &config, &mut NoProgress).unwrap();
    out
}

fn decode(container: Vec<u8>) -> Vec<u8> {
    let backend = MemBackend::from_vec(container);
    let mut out = Vec::new();
    decode_vhd(&backend, &mut out, &DecodeOptions::default(), &mut NoProgress).unwrap();
    out
}

fn allocated_set(container: &[u8]) -> Vec<bool> {
    let entries = be_u32(&container[512 + 28..]) as usize;
    let table = be_u64(&container[512 + 16..]) as usize;
    (0..entries)
        .map(|i| be_u32(&container[table + i * 4..]) != BAT_UNALLOCATED)
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn dynamic_vhd_roundtrip(image in image_strategy(), block in block_size_strategy(), threads in 1usize..=3) {
        let container = encode(&image.data, block, threads);
        prop_assert_eq!(decode(container), image.data);
    }

    #[test]
    fn footer_copies_are_identical(image in image_strategy(), block in block_size_strategy()) {
        let container = encode(&image.data, block, 1);
        let n = container.len();
        prop_assert_eq!(&container[..512], &container[n - 512..]);
    }

    #[test]
    fn records_carry_valid_checksums(image in image_strategy(), block in block_size_strategy()) {
        let container = encode(&image.data, block, 1);

        let mut footer = container[..512].to_vec();
        let stored = be_u32(&footer[64..]);
        footer[64..68].fill(0);
        prop_assert_eq!(stored, checksum(&footer));

        let mut header = container[512..1536].to_vec();
        let stored = be_u32(&header[36..]);
        header[36..40].fill(0);
        prop_assert_eq!(stored, checksum(&header));
    }

    #[test]
    fn bat_has_one_entry_per_block(image in image_strategy(), block in block_size_strategy()) {
        let container = encode(&image.data, block, 1);
        let sectors = (image.data.len() / SECTOR_SIZE) as u64;
        let sectors_per_block = u64::from(block) / SECTOR_SIZE as u64;
        let entries = u64::from(be_u32(&container[512 + 28..]));
        prop_assert_eq!(entries, sectors.div_ceil(sectors_per_block));
    }

    #[test]
    fn blocks_are_allocated_iff_non_zero(image in image_strategy(), block in block_size_strategy()) {
        let container = encode(&image.data, block, 1);
        let expected: Vec<bool> = image
            .data
            .chunks(block as usize)
            .map(|chunk| chunk.iter().any(|&b| b != 0))
            .collect();
        let bat_bytes = (expected.len() * 4).div_ceil(512) * 512;
        prop_assert_eq!(allocated_set(&container), expected);

        let allocated = allocated_set(&container).iter().filter(|&&a| a).count();
        let block_on_disk = 512 + block as usize;
        prop_assert_eq!(
            container.len(),
            512 + 1024 + bat_bytes + allocated * block_on_disk + 512
        );
    }

    #[test]
    fn reencoding_decoded_image_allocates_the_same_blocks(image in image_strategy(), block in block_size_strategy()) {
        let first = encode(&image.data, block, 1);
        let second = encode(&decode(first.clone()), block, 1);
        prop_assert_eq!(allocated_set(&first), allocated_set(&second));
    }

    #[test]
    fn sprs_roundtrip(image in image_strategy()) {
        let source = ImageSource::flat(MemBackend::from_vec(image.data.clone())).unwrap();
        let mut encoded = Vec::new();
        encode_sprs(&source, &mut encoded, &mut NoProgress).unwrap();

        let mut decoded = Vec::new();
        decode_sprs(&MemBackend::from_vec(encoded), &mut decoded, &mut NoProgress).unwrap();
        prop_assert_eq!(decoded, image.data);
    }
}
