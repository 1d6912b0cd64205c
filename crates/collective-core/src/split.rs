//! Pure arithmetic for the hierarchical allreduce's padding and per-rank
//! split. Kept free of any device/transport dependency so it can be
//! property-tested on its own.

/// Rounds `num_elements` up to the nearest multiple of `local_size *
/// fusion_atom`, but only when the batch is a true fusion (`entry_count
/// >= 2`) on a homogeneous cluster. Single-entry batches and heterogeneous
/// clusters are returned unchanged.
pub fn padded_element_count(
    num_elements: i64,
    local_size: usize,
    fusion_atom: i64,
    entry_count: usize,
    is_homogeneous: bool,
) -> i64 {
    if !is_homogeneous || entry_count < 2 || local_size == 0 {
        return num_elements;
    }
    let atom = local_size as i64 * fusion_atom;
    if atom <= 0 {
        return num_elements;
    }
    let quotient = num_elements / atom;
    let remainder = num_elements % atom;
    let div_ceil = if (remainder > 0 && atom > 0) || (remainder < 0 && atom < 0) {
        quotient + 1
    } else {
        quotient
    };
    div_ceil * atom
}

/// The per-rank shard size and the tail remainder for a hierarchical
/// reduction over `local_size` intra-node peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    /// Elements each local rank owns after reduce-scatter. Zero in the
    /// heterogeneous case, or when `num_elements < local_size`.
    pub eper: i64,
    /// Elements handled solely by `root` via the tail path.
    pub erem: i64,
    /// The local rank that owns the tail and all cross-node traffic for
    /// a heterogeneous cluster.
    pub root: usize,
}

/// Computes the reduce-scatter shard size, remainder, and tail root for a
/// reduction of `num_elements` across `local_size` intra-node peers.
pub fn compute_split(num_elements: i64, local_size: usize, is_homogeneous: bool) -> Split {
    if local_size == 0 {
        return Split {
            eper: 0,
            erem: num_elements,
            root: 0,
        };
    }
    if !is_homogeneous {
        return Split {
            eper: 0,
            erem: num_elements,
            root: 0,
        };
    }
    let ls = local_size as i64;
    Split {
        eper: num_elements / ls,
        erem: num_elements % ls,
        root: local_size - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_padding_for_single_entry_batch() {
        assert_eq!(padded_element_count(1026, 2, 64, 1, true), 1026);
    }

    #[test]
    fn pads_homogeneous_multi_entry_batch_to_atom_multiple() {
        // local_size=2, FUSION_ATOM=64 -> atom of 128; 1026 -> 1152.
        assert_eq!(padded_element_count(1026, 2, 64, 2, true), 1152);
    }

    #[test]
    fn exact_multiple_is_unchanged() {
        assert_eq!(padded_element_count(1024, 2, 64, 2, true), 1024);
    }

    #[test]
    fn heterogeneous_cluster_skips_padding() {
        assert_eq!(padded_element_count(1026, 2, 64, 2, false), 1026);
    }

    #[test]
    fn compute_split_homogeneous_divides_evenly() {
        let s = compute_split(1152, 2, true);
        assert_eq!(
            s,
            Split {
                eper: 576,
                erem: 0,
                root: 1
            }
        );
    }

    #[test]
    fn compute_split_below_local_size_runs_entirely_through_tail() {
        let s = compute_split(1, 4, true);
        assert_eq!(
            s,
            Split {
                eper: 0,
                erem: 1,
                root: 3
            }
        );
    }

    #[test]
    fn compute_split_heterogeneous_forces_zero_eper() {
        let s = compute_split(10_000, 4, false);
        assert_eq!(
            s,
            Split {
                eper: 0,
                erem: 10_000,
                root: 0
            }
        );
    }
}
