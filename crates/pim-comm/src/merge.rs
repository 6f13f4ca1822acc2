//! Host-staged merge helpers
//!
//! The conventional path reads every unit's block into host memory, combines
//! the blocks here with plain loops, and writes the results back. Inputs are
//! indexed by unit; a [`MergeLayout`] says which units form a group and in
//! which partner order.
//!
//! Groups are processed in parallel with rayon. Each task owns its output,
//! and partners are always combined in ascending partner order.

use crate::error::{CommError, Result};
use crate::kernels::{ElementWidth, ReduceKind, Signedness};
use rayon::prelude::*;

/// Grouping of unit indices, partner order within each group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLayout {
    groups: Vec<Vec<usize>>,
}

impl MergeLayout {
    /// Partners contiguous: group `g` is `g * partners .. (g + 1) * partners`
    pub fn parallel(partners: usize, groups: usize) -> Self {
        Self {
            groups: (0..groups)
                .map(|g| (0..partners).map(|p| g * partners + p).collect())
                .collect(),
        }
    }

    /// Partners strided: group `g` is `g, g + groups, g + 2 * groups, ..`
    pub fn strided(partners: usize, groups: usize) -> Self {
        Self {
            groups: (0..groups)
                .map(|g| (0..partners).map(|p| g + p * groups).collect())
                .collect(),
        }
    }

    /// Explicit groups
    ///
    /// # Errors
    ///
    /// Returns a host buffer error if there are no groups, a group is empty,
    /// or group sizes differ.
    pub fn from_groups(groups: Vec<Vec<usize>>) -> Result<Self> {
        let Some(first) = groups.first() else {
            return Err(CommError::host_buffer("merge layout without groups"));
        };
        let partners = first.len();
        if partners == 0 || groups.iter().any(|g| g.len() != partners) {
            return Err(CommError::host_buffer("merge groups must be non-empty and equal-sized"));
        }
        Ok(Self { groups })
    }

    /// Groups in layout order
    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    /// Partners per group
    pub fn partners(&self) -> usize {
        self.groups.first().map_or(0, Vec::len)
    }

    fn check(&self, partials: &[Vec<u8>]) -> Result<usize> {
        let len = partials.first().map_or(0, Vec::len);
        if partials.iter().any(|p| p.len() != len) {
            return Err(CommError::host_buffer("partial buffers differ in length"));
        }
        if let Some(&bad) = self.groups.iter().flatten().find(|&&u| u >= partials.len()) {
            return Err(CommError::host_buffer(format!(
                "layout names unit {bad}, only {} partials",
                partials.len()
            )));
        }
        Ok(len)
    }
}

/// Element-wise reduction of `src` into `acc` (equal lengths, multiple of
/// the element width)
pub fn reduce_bytes(
    acc: &mut [u8],
    src: &[u8],
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) {
    let w = width.bytes();
    for (a, s) in acc.chunks_exact_mut(w).zip(src.chunks_exact(w)) {
        let mut x = [0u8; 8];
        let mut y = [0u8; 8];
        x[..w].copy_from_slice(a);
        y[..w].copy_from_slice(s);
        let (x, y) = (u64::from_le_bytes(x), u64::from_le_bytes(y));
        let bits = width.bits();
        let r = match (kind, sign) {
            (ReduceKind::Sum, _) => x.wrapping_add(y),
            (ReduceKind::Max, Signedness::Unsigned) => x.max(y),
            (ReduceKind::Max, Signedness::Signed) => {
                let shift = 64 - bits;
                #[allow(clippy::cast_possible_wrap)]
                let (sx, sy) = (((x << shift) as i64) >> shift, ((y << shift) as i64) >> shift);
                if sx >= sy {
                    x
                } else {
                    y
                }
            }
        };
        a.copy_from_slice(&r.to_le_bytes()[..w]);
    }
}

fn check_width(len: usize, width: ElementWidth) -> Result<()> {
    if len % width.bytes() != 0 {
        return Err(CommError::host_buffer(format!(
            "{len} bytes is not a whole number of {width} elements"
        )));
    }
    Ok(())
}

/// Reduce every group to one buffer, in layout order
///
/// # Errors
///
/// Returns a host buffer error if the partials do not match the layout.
pub fn reduce(
    partials: &[Vec<u8>],
    layout: &MergeLayout,
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) -> Result<Vec<Vec<u8>>> {
    let len = layout.check(partials)?;
    check_width(len, width)?;
    Ok(layout
        .groups
        .par_iter()
        .map(|group| {
            let mut acc = partials[group[0]].clone();
            for &u in &group[1..] {
                reduce_bytes(&mut acc, &partials[u], width, kind, sign);
            }
            acc
        })
        .collect())
}

/// Sum groups laid out along x (`axis_parallel`) or y
///
/// # Errors
///
/// Returns a host buffer error if the partials do not split into groups of
/// `partners`.
pub fn reduce_sum(
    partials: &[Vec<u8>],
    partners: usize,
    axis_parallel: bool,
    width: ElementWidth,
) -> Result<Vec<Vec<u8>>> {
    if partners == 0 || partials.len() % partners != 0 {
        return Err(CommError::host_buffer(format!(
            "{} partials do not split into groups of {partners}",
            partials.len()
        )));
    }
    let groups = partials.len() / partners;
    let layout = if axis_parallel {
        MergeLayout::parallel(partners, groups)
    } else {
        MergeLayout::strided(partners, groups)
    };
    reduce(partials, &layout, width, ReduceKind::Sum, Signedness::Signed)
}

/// Shard `q` of each group total, returned per unit (indexed like `partials`)
///
/// Units not named by the layout get an empty buffer.
///
/// # Errors
///
/// Returns a host buffer error if the partials do not hold one shard per
/// partner.
pub fn reduce_scatter(
    partials: &[Vec<u8>],
    layout: &MergeLayout,
    shard: usize,
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) -> Result<Vec<Vec<u8>>> {
    let len = layout.check(partials)?;
    if len < shard * layout.partners() {
        return Err(CommError::host_buffer(format!(
            "partials hold {len} bytes, {} partners need {}",
            layout.partners(),
            shard * layout.partners()
        )));
    }
    check_width(shard, width)?;
    let per_group: Vec<Vec<(usize, Vec<u8>)>> = layout
        .groups
        .par_iter()
        .map(|group| {
            group
                .iter()
                .enumerate()
                .map(|(q, &dst)| {
                    let range = q * shard..(q + 1) * shard;
                    let mut acc = partials[group[0]][range.clone()].to_vec();
                    for &u in &group[1..] {
                        reduce_bytes(&mut acc, &partials[u][range.clone()], width, kind, sign);
                    }
                    (dst, acc)
                })
                .collect()
        })
        .collect();
    let mut out = vec![Vec::new(); partials.len()];
    for (dst, shard) in per_group.into_iter().flatten() {
        out[dst] = shard;
    }
    Ok(out)
}

/// Concatenate each group's partials in partner order, in layout order
///
/// # Errors
///
/// Returns a host buffer error if the partials do not match the layout.
pub fn gather(partials: &[Vec<u8>], layout: &MergeLayout) -> Result<Vec<Vec<u8>>> {
    layout.check(partials)?;
    Ok(layout
        .groups
        .par_iter()
        .map(|group| group.iter().flat_map(|&u| partials[u].iter().copied()).collect())
        .collect())
}

/// Personalised exchange: unit `q` receives slot `q` of every partner,
/// placed at slot `p` (indexed like `partials`)
///
/// # Errors
///
/// Returns a host buffer error if the partials do not hold one slot per
/// partner.
pub fn alltoall(partials: &[Vec<u8>], layout: &MergeLayout, slot: usize) -> Result<Vec<Vec<u8>>> {
    let len = layout.check(partials)?;
    if len != slot * layout.partners() {
        return Err(CommError::host_buffer(format!(
            "partials hold {len} bytes, expected {} slots of {slot}",
            layout.partners()
        )));
    }
    let per_group: Vec<Vec<(usize, Vec<u8>)>> = layout
        .groups
        .par_iter()
        .map(|group| {
            group
                .iter()
                .enumerate()
                .map(|(q, &dst)| {
                    let block = group
                        .iter()
                        .flat_map(|&src| partials[src][q * slot..(q + 1) * slot].iter().copied())
                        .collect();
                    (dst, block)
                })
                .collect()
        })
        .collect();
    let mut out = vec![Vec::new(); partials.len()];
    for (dst, block) in per_group.into_iter().flatten() {
        out[dst] = block;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn layouts() {
        assert_eq!(MergeLayout::parallel(2, 2).groups(), &[vec![0, 1], vec![2, 3]]);
        assert_eq!(MergeLayout::strided(2, 2).groups(), &[vec![0, 2], vec![1, 3]]);
        assert!(MergeLayout::from_groups(vec![vec![0], vec![1, 2]]).is_err());
        assert!(MergeLayout::from_groups(Vec::new()).is_err());
    }

    #[test]
    fn reduce_sum_along_both_axes() {
        let partials: Vec<Vec<u8>> = (0..4).map(|i| words(&[i, 10 * i])).collect();
        let x = reduce_sum(&partials, 2, true, ElementWidth::W4).unwrap();
        assert_eq!(x, vec![words(&[1, 10]), words(&[5, 50])]);
        let y = reduce_sum(&partials, 2, false, ElementWidth::W4).unwrap();
        assert_eq!(y, vec![words(&[2, 20]), words(&[4, 40])]);
    }

    #[test]
    fn signed_max_merge() {
        let partials = vec![vec![0x80, 0x01], vec![0x7F, 0x02]];
        let layout = MergeLayout::parallel(2, 1);
        let signed = reduce(&partials, &layout, ElementWidth::W1, ReduceKind::Max, Signedness::Signed).unwrap();
        assert_eq!(signed[0], vec![0x7F, 0x02]);
        let unsigned = reduce(&partials, &layout, ElementWidth::W1, ReduceKind::Max, Signedness::Unsigned).unwrap();
        assert_eq!(unsigned[0], vec![0x80, 0x02]);
    }

    #[test]
    fn reduce_scatter_assigns_shards() {
        let partials: Vec<Vec<u8>> = (0..2).map(|i| words(&[i + 1, 10 * (i + 1)])).collect();
        let out = reduce_scatter(
            &partials,
            &MergeLayout::parallel(2, 1),
            4,
            ElementWidth::W4,
            ReduceKind::Sum,
            Signedness::Signed,
        )
        .unwrap();
        assert_eq!(out, vec![words(&[3]), words(&[30])]);
    }

    #[test]
    fn gather_and_alltoall() {
        let partials = vec![vec![1, 2], vec![3, 4]];
        let layout = MergeLayout::parallel(2, 1);
        assert_eq!(gather(&partials, &layout).unwrap(), vec![vec![1, 2, 3, 4]]);
        assert_eq!(alltoall(&partials, &layout, 1).unwrap(), vec![vec![1, 3], vec![2, 4]]);
        assert!(alltoall(&partials, &layout, 2).is_err());
    }
}
