//! Collective correctness on the simulated fabric, both paths

mod common;

use common::{expect_all_gather, expect_all_reduce, expect_alltoall, expect_reduce_scatter, fill, groups, job};
use pim_comm::prelude::*;
use pim_comm::Phase;

const PATHS: [CollectivePath; 2] = [CollectivePath::Library, CollectivePath::Conventional];

fn words(values: impl IntoIterator<Item = u32>) -> Vec<u8> {
    values.into_iter().flat_map(u32::to_le_bytes).collect()
}

/// Four partners, eight 32-bit elements, `v_i[j] = i * 8 + j`
#[test]
fn all_reduce_four_partners() {
    for path in PATHS {
        for comm in ["10", "01"] {
            let job = job(&[4, 4], path);
            let cube = job.manager();
            let axis = CommAxis::parse(comm, 2).unwrap();
            let blocks: Vec<Vec<u8>> = (0..16)
                .map(|u| {
                    let i = cube.partner_index(axis, u) as u32;
                    words((0..8).map(|j| i * 8 + j))
                })
                .collect();
            job.write_units(0, &blocks).unwrap();

            let report = job
                .engine()
                .all_reduce(comm, 32, 0, 0x100, 0x200, 4, ReduceKind::Sum)
                .unwrap();
            assert_eq!(
                report.phases,
                match path {
                    CollectivePath::Library => {
                        vec![Phase::NotStarted, Phase::Transferring, Phase::Reducing, Phase::Done]
                    }
                    CollectivePath::Conventional => vec![
                        Phase::NotStarted,
                        Phase::Transferring,
                        Phase::Reducing,
                        Phase::Transferring,
                        Phase::Done,
                    ],
                }
            );

            let expected = words((0..8).map(|j| 48 + 4 * j));
            for (u, out) in job.read_units(0x100, 32).unwrap().iter().enumerate() {
                assert_eq!(out, &expected, "{path} {comm} unit {u}");
            }
        }
    }
}

#[test]
fn alltoall_matches_reference() {
    for path in PATHS {
        for (lens, comm, total) in [
            (&[8, 4][..], "10", 64),
            (&[8, 4][..], "01", 32),
            (&[4, 2, 8][..], "101", 256),
            (&[2, 2, 16][..], "011", 128),
            (&[4, 4][..], "10", 8),
            (&[2, 4][..], "10", 8),
        ] {
            let job = job(lens, path);
            let src = fill(&job, 0, total, 7);
            job.engine().alltoall(comm, total, 0, 0x1000, 0x2000).unwrap();
            let expected = expect_alltoall(&src, &groups(&job, comm));
            assert_eq!(job.read_units(0x1000, total).unwrap(), expected, "{path} {lens:?} {comm}");
        }
    }
}

#[test]
fn all_gather_matches_reference_and_is_idempotent() {
    for path in PATHS {
        for (lens, comm) in [(&[8, 8][..], "10"), (&[4, 2, 8][..], "110"), (&[16, 4][..], "01")] {
            let job = job(lens, path);
            let src = fill(&job, 0x40, 16, 11);
            let partners = groups(&job, comm)[0].len();
            let out_len = 16 * partners;

            job.engine().all_gather(comm, 16, 0x40, 0x800, 0x4000).unwrap();
            let first = job.read_units(0x800, out_len).unwrap();
            assert_eq!(first, expect_all_gather(&src, &groups(&job, comm)), "{path} {lens:?}");

            job.engine().all_gather(comm, 16, 0x40, 0x800, 0x4000).unwrap();
            assert_eq!(job.read_units(0x800, out_len).unwrap(), first);
        }
    }
}

#[test]
fn reduce_scatter_shards_and_untouched_bytes() {
    for path in PATHS {
        for (lens, comm, total, element) in [
            (&[8, 2][..], "10", 64, 4),
            (&[4, 4][..], "11", 128, 8),
            (&[4, 4][..], "10", 8, 2),
            (&[2, 8][..], "10", 8, 4),
            (&[8, 8][..], "01", 16, 1),
        ] {
            let job = job(lens, path);
            let src = fill(&job, 0, total, 3);
            let sentinel: Vec<Vec<u8>> = vec![vec![0xAB; 64]; job.manager().unit_count()];
            job.write_units(0x400, &sentinel).unwrap();

            let width = ElementWidth::from_bytes(element).unwrap();
            job.engine()
                .reduce_scatter(comm, total, 0, 0x410, 0x800, element)
                .unwrap();
            let expected = expect_reduce_scatter(
                &src,
                &groups(&job, comm),
                width,
                ReduceKind::Sum,
                Signedness::Signed,
            );
            for (u, window) in job.read_units(0x400, 64).unwrap().iter().enumerate() {
                let shard = expected[u].len();
                assert_eq!(&window[0x10..0x10 + shard], expected[u].as_slice(), "{path} {lens:?} unit {u}");
                assert!(window[..0x10].iter().all(|&b| b == 0xAB));
                assert!(window[0x10 + shard..].iter().all(|&b| b == 0xAB), "{path} {lens:?} unit {u}");
            }
        }
    }
}

#[test]
fn max_respects_signedness() {
    for sign in [Signedness::Signed, Signedness::Unsigned] {
        for path in PATHS {
            let mut job = job(&[8, 2], path);
            job.set_config(job.config().with_signedness(sign));
            let src = fill(&job, 0, 32, 21);
            job.engine()
                .all_reduce("11", 32, 0, 64, 128, 2, ReduceKind::Max)
                .unwrap();
            let expected = expect_all_reduce(&src, &groups(&job, "11"), ElementWidth::W2, ReduceKind::Max, sign);
            assert_eq!(job.read_units(64, 32).unwrap(), expected, "{path} {sign:?}");
        }
    }
}

#[test]
fn overlapping_source_and_target_bounce() {
    for path in PATHS {
        let job = job(&[8, 4], path);
        let src = fill(&job, 0, 64, 5);
        job.engine().all_reduce("11", 64, 0, 0, 0x1000, 8, ReduceKind::Sum).unwrap();
        let expected = expect_all_reduce(
            &src,
            &groups(&job, "11"),
            ElementWidth::W8,
            ReduceKind::Sum,
            Signedness::Signed,
        );
        assert_eq!(job.read_units(0, 64).unwrap(), expected, "{path}");
    }
}

#[test]
fn gather_scatter_roundtrip_and_reduce() {
    for path in PATHS {
        let job = job(&[4, 4, 2], path);
        let src = fill(&job, 0x20, 24, 9);
        let engine = job.engine();

        let mut host = vec![vec![0u8; 24 * 8]; 4];
        engine.gather("011", 24, 0x20, &mut host).unwrap();
        for (buf, group) in host.iter().zip(groups(&job, "011")) {
            for (p, &u) in group.iter().enumerate() {
                assert_eq!(&buf[p * 24..(p + 1) * 24], src[u].as_slice());
            }
        }

        engine.scatter("011", 24, 0x300, &host).unwrap();
        assert_eq!(job.read_units(0x300, 24).unwrap(), src);

        let mut totals = vec![vec![0u8; 24]; 4];
        engine.reduce("011", 24, 0x20, 4, ReduceKind::Sum, &mut totals).unwrap();
        let expected = expect_all_reduce(
            &src,
            &groups(&job, "011"),
            ElementWidth::W4,
            ReduceKind::Sum,
            Signedness::Signed,
        );
        for (total, group) in totals.iter().zip(groups(&job, "011")) {
            assert_eq!(total, &expected[group[0]]);
        }
    }
}

#[test]
fn broadcast_reaches_every_unit() {
    let job = job(&[16, 8], CollectivePath::Library);
    let report = job.engine().broadcast(b"pim-broadcast-payload", 0x103).unwrap();
    assert_eq!(report.op, CollectiveOp::Broadcast);
    for unit in job.read_units(0x100, 32).unwrap() {
        assert_eq!(&unit[3..24], b"pim-broadcast-payload");
        assert_eq!(unit[..3], [0, 0, 0]);
    }
}

#[test]
fn configuration_errors_before_io() {
    let job = job(&[8, 8], CollectivePath::Library);
    let engine = job.engine();
    let err = engine
        .all_reduce("10", 64, 0, common::MRAM - 32, 0x1000, 4, ReduceKind::Sum)
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains(&(common::MRAM + 32).to_string()), "{text}");
    assert!(text.contains(&common::MRAM.to_string()), "{text}");

    assert!(matches!(
        engine.all_gather("10", 12, 0, 0x100, 0),
        Err(CommError::Misaligned { .. })
    ));
    assert!(matches!(
        engine.reduce_scatter("10", 8, 0, 0x100, 0, 2),
        Err(CommError::InvalidShape { .. })
    ));
    assert!(matches!(
        engine.alltoall("10", 64, 0, 32, 16),
        Err(CommError::BufferOverlap { .. })
    ));
    assert!(matches!(engine.all_gather("101", 8, 0, 64, 0), Err(CommError::InvalidAxisSpec { .. })));
}
