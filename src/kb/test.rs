// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

#[cfg(test)]
mod e2e_tests {
    use std::{
        collections::BTreeSet,
        path::Path,
    };

    use proptest::{
        collection::vec,
        prelude::ProptestConfig,
        proptest,
    };
    use tempfile::tempdir;

    use crate::{
        config::KbConfig,
        diff::DiffKind,
        errs::TridentError,
        itr::{
            BoxedItr,
            PairItr,
            PairItrExt,
        },
        kb::{
            Kb,
            KbBuilder,
            Querier,
        },
        perm::Permutation,
    };

    const BASE: [[u64; 3]; 3] = [[1, 1, 2], [1, 1, 3], [2, 1, 3]];

    fn build_cfg() -> KbConfig {
        let mut cfg = KbConfig::for_writing();
        cfg.set_tree_max_elements_node(8)
            .set_threshold_skip_table(2)
            .set_parallel_build(false);
        cfg
    }

    fn build(dir: &Path, cfg: KbConfig, triples: &[[u64; 3]]) -> Kb {
        let mut builder = KbBuilder::new(dir, cfg).unwrap();
        for [s, p, o] in triples {
            builder.add_triple(*s, *p, *o).unwrap();
        }
        builder.build().unwrap();
        Kb::open(dir, KbConfig::default()).unwrap()
    }

    fn pairs(itr: &mut BoxedItr) -> Vec<(i64, i64)> {
        itr.collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.1, t.2))
            .collect()
    }

    /// Every triple of `itr`, read in `perm`, back in SPO order.
    fn triples_of(perm: Permutation, itr: &mut BoxedItr) -> Vec<[i64; 3]> {
        let mut out: Vec<_> = itr
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| perm.unpermute([t.0, t.1, t.2]))
            .collect();
        out.sort_unstable();
        out
    }

    fn keys_and_counts(mut itr: BoxedItr) -> Vec<(i64, u64)> {
        itr.collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.0, t.3))
            .collect()
    }

    #[test]
    fn test_deletion_shrinks_predicate_groups() {
        let dir = tempdir().unwrap();
        let kb = build(dir.path(), build_cfg(), &BASE);
        let mut q = kb.query().unwrap();

        let mut pos = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        assert_eq!(pairs(&mut pos), vec![(2, 1), (3, 1), (3, 2)]);
        assert_eq!(q.get_card(-1, 1, -1).unwrap(), 3);

        let mut groups = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        groups.ignore_second_column().unwrap();
        let counted: Vec<_> = groups
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.1, t.3))
            .collect();
        assert_eq!(counted, vec![(2, 1), (3, 2)]);
        drop(q);

        assert!(kb.apply_update(DiffKind::Deletion, vec![[1, 1, 2]]).unwrap());
        // deleting it again changes nothing
        assert!(!kb.apply_update(DiffKind::Deletion, vec![[1, 1, 2]]).unwrap());
        assert_eq!(kb.n_updates(), 1);

        let mut q = kb.query().unwrap();
        assert_eq!(q.get_card(-1, 1, -1).unwrap(), 2);
        assert_eq!(q.get_input_size(), 2);
        assert!(!q.exists(1, 1, 2).unwrap());
        assert!(q.exists(1, 1, 3).unwrap());
        let mut pos = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        assert_eq!(pairs(&mut pos), vec![(3, 1), (3, 2)]);

        let mut groups = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        groups.ignore_second_column().unwrap();
        assert_eq!(groups.cardinality().unwrap(), 1);
        assert_eq!(q.get_n_first_tables_per_partition(Permutation::Pos), 1);
    }

    #[test]
    fn test_additions_merge_with_the_base() {
        let dir = tempdir().unwrap();
        let kb = build(dir.path(), build_cfg(), &BASE);
        // no two components shared: stored with three permutations
        assert!(kb.apply_update(DiffKind::Addition, vec![[3, 1, 4], [3, 2, 5], [1, 1, 2]]).unwrap());

        let mut q = kb.query().unwrap();
        assert_eq!(q.get_input_size(), 5);
        assert_eq!(q.get_card(3, -1, -1).unwrap(), 2);
        assert_eq!(q.get_card(-1, 1, -1).unwrap(), 4);

        let mut scan = q.get(Permutation::Spo, -1, -1, -1).unwrap();
        assert_eq!(triples_of(Permutation::Spo, &mut scan), vec![
            [1, 1, 2],
            [1, 1, 3],
            [2, 1, 3],
            [3, 1, 4],
            [3, 2, 5]
        ]);

        let mut pos = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        assert_eq!(pairs(&mut pos), vec![(2, 1), (3, 1), (3, 2), (4, 3)]);
        let mut groups = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        groups.ignore_second_column().unwrap();
        assert_eq!(groups.cardinality().unwrap(), 3);

        assert_eq!(keys_and_counts(q.get_term_list(Permutation::Pso).unwrap()), vec![(1, 4), (2, 1)]);
        assert_eq!(q.get_n_first_tables_per_partition(Permutation::Pos), 4);
        assert_eq!(q.n_keys(Permutation::Pos), 2);

        let added = q.summary_add_diff().unwrap().unwrap();
        assert_eq!(keys_and_counts(added).len(), 2);
        assert!(q.summary_rm_diff().unwrap().is_none());
    }

    #[test]
    fn test_delete_then_add_back() {
        let dir = tempdir().unwrap();
        let kb = build(dir.path(), build_cfg(), &BASE);
        assert!(kb.apply_update(DiffKind::Deletion, vec![[1, 1, 2], [1, 1, 3]]).unwrap());
        assert!(kb.apply_update(DiffKind::Addition, vec![[1, 1, 2]]).unwrap());

        let mut q = kb.query().unwrap();
        assert!(q.exists(1, 1, 2).unwrap());
        assert!(!q.exists(1, 1, 3).unwrap());
        assert_eq!(q.get_card(1, -1, -1).unwrap(), 1);
        let mut spo = q.get(Permutation::Spo, 1, -1, -1).unwrap();
        assert_eq!(pairs(&mut spo), vec![(1, 2)]);

        let mut added = q.summary_add_diff().unwrap().unwrap();
        assert_eq!(triples_of(Permutation::Spo, &mut added), vec![[1, 1, 2]]);
        let mut removed = q.summary_rm_diff().unwrap().unwrap();
        assert_eq!(triples_of(Permutation::Spo, &mut removed), vec![[1, 1, 3]]);

        // term lists drop keys left without triples
        assert_eq!(keys_and_counts(q.get_term_list(Permutation::Osp).unwrap()), vec![(2, 1), (3, 1)]);
    }

    #[test]
    fn test_updates_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let kb = build(dir.path(), build_cfg(), &BASE);
            kb.apply_update(DiffKind::Deletion, vec![[2, 1, 3]]).unwrap();
            kb.apply_update(DiffKind::Addition, vec![[5, 6, 7], [8, 9, 10]]).unwrap();
            kb.close().unwrap();
        }
        let kb = Kb::open(dir.path(), KbConfig::default()).unwrap();
        assert_eq!(kb.n_updates(), 2);
        let mut q = kb.query().unwrap();
        assert_eq!(q.n_updates(), 2);
        assert_eq!(q.get_input_size(), 4);
        assert!(!q.exists(2, 1, 3).unwrap());
        assert!(q.exists(8, 9, 10).unwrap());
        assert!(q.is_empty(2, -1, -1).unwrap());
        assert!(!q.is_empty(-1, -1, -1).unwrap());

        // a newer update lands after the reopened ones
        kb.apply_update(DiffKind::Addition, vec![[2, 1, 3]]).unwrap();
        assert_eq!(kb.n_updates(), 3);
        assert!(kb.query().unwrap().exists(2, 1, 3).unwrap());
    }

    #[test]
    fn test_dictionary_round_trip() {
        let dir = tempdir().unwrap();
        let mut builder = KbBuilder::new(dir.path(), build_cfg()).unwrap();
        let alice = builder.add_text_triple(b"<alice>", b"<knows>", b"<bob>").unwrap();
        let bob = builder.add_text_triple(b"<bob>", b"<knows>", b"<carol>").unwrap();
        assert_eq!(alice[1], bob[1]);
        assert_eq!(alice[2], bob[0]);
        let stats = builder.build().unwrap();
        assert_eq!(stats.n_triples, 2);
        assert_eq!(stats.next_id, 4);

        let kb = Kb::open(dir.path(), KbConfig::default()).unwrap();
        let dict = kb.dict();
        assert_eq!(dict.get_number(b"<knows>").unwrap(), Some(alice[1]));
        assert_eq!(dict.get_text(bob[2]).unwrap().as_deref(), Some(&b"<carol>"[..]));
        assert_eq!(dict.get_number(b"<dave>").unwrap(), None);

        let mut q = kb.query().unwrap();
        let mut objects = q.get(Permutation::Pos, -1, alice[1] as i64, -1).unwrap();
        assert_eq!(pairs(&mut objects).len(), 2);
    }

    #[test]
    fn test_index_selection() {
        use Permutation::*;
        let dir = tempdir().unwrap();
        let kb = build(dir.path(), build_cfg(), &BASE);
        let q = kb.query().unwrap();
        assert_eq!(q.get_index(5, -1, -1), Sop);
        assert_eq!(q.get_index(5, 3, -1), Spo);
        assert_eq!(q.get_index(5, -2, -1), Spo);
        assert_eq!(q.get_index(5, -1, -2), Sop);
        assert_eq!(q.get_index(-1, -1, 7), Osp);
        assert_eq!(q.get_index(-1, -2, 7), Ops);
        assert_eq!(q.get_index(-1, 3, -2), Pos);
        assert_eq!(q.get_index(-1, 3, -1), Pso);
        assert_eq!(q.get_index(-2, -1, -1), Spo);
        assert_eq!(q.get_index(-2, -1, -2), Sop);
        assert_eq!(q.get_index(-1, -1, -1), Spo);
        assert_eq!(q.get_order(Pos), Pos.order());
        assert_eq!(q.get_inv_order(Osp), Osp.inv_order());
    }

    #[test]
    fn test_cardinalities() {
        let dir = tempdir().unwrap();
        let kb = build(dir.path(), build_cfg(), &BASE);
        let mut q = kb.query().unwrap();

        // distinct subjects and objects under predicate 1
        assert_eq!(q.get_card_column(-1, 1, -1, 0).unwrap(), 2);
        assert_eq!(q.get_card_column(-1, 1, -1, 2).unwrap(), 2);
        assert_eq!(q.get_card_column(1, -1, -1, 2).unwrap(), 2);
        assert!(q.get_card_column(-1, 1, -1, 1).unwrap_err().is_misuse());

        assert_eq!(q.get_card_on_index(Permutation::Pos, -1, 1, -1, true).unwrap(), 2);
        assert_eq!(q.get_card_on_index(Permutation::Pos, -1, 1, -1, false).unwrap(), 3);
        assert_eq!(q.get_card_on_index(Permutation::Spo, -1, 1, -1, false).unwrap(), 3);
        assert_eq!(q.get_card_on_index(Permutation::Spo, 1, 1, 2, false).unwrap(), 1);
        assert_eq!(q.get_card_on_index(Permutation::Spo, 9, 1, -1, false).unwrap(), 0);

        assert_eq!(q.get_card(1, 1, 2).unwrap(), 1);
        assert_eq!(q.get_card(1, 1, 9).unwrap(), 0);
        assert_eq!(q.get_card(-1, -1, -1).unwrap(), 3);
        assert_eq!(q.est_card(-1, 1, -1).unwrap(), 3);
        assert_eq!(q.est_card(1, 1, 2).unwrap(), 1);
        assert!(q.est_card(1, 1, -1).unwrap() >= 1);
        assert_eq!(q.est_card_on_index(Permutation::Ops, -1, -1, 3).unwrap(), 2);
        assert_eq!(q.est_card_on_index(Permutation::Ops, 1, -1, -1).unwrap(), 3);

        assert!(q.exist_key(Permutation::Pos, 1).unwrap());
        assert!(!q.exist_key(Permutation::Pos, 7).unwrap());
        assert!(q.is_empty(5, 5, 5).unwrap());
        assert_eq!(q.is_aggregated(Permutation::Pos, -1, 1, -1).unwrap(), 0);
        assert_eq!(q.is_reverse(Permutation::Spo, 1, -1, -1).unwrap(), 0);
    }

    #[test]
    fn test_reverse_lookup_and_swap() {
        let dir = tempdir().unwrap();
        let kb = build(dir.path(), build_cfg(), &BASE);
        let mut q = kb.query().unwrap();
        // only the object is bound after the key
        let mut spo = q.get(Permutation::Spo, 1, -1, 3).unwrap();
        let t = spo.collect_tuples().unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(Permutation::Spo.unpermute([t[0].0, t[0].1, t[0].2]), [1, 1, 3]);

        let mut sop = q.get(Permutation::Sop, 1, -1, -1).unwrap();
        let mut swapped = q.new_itr_on_reverse(sop.as_mut(), None, None).unwrap();
        let got: Vec<_> = swapped
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.1, t.2))
            .collect();
        assert_eq!(got, vec![(1, 2), (1, 3)]);
        q.release_itr(sop);
    }

    #[test]
    fn test_aggregated_predicate_tables() {
        let dir = tempdir().unwrap();
        let mut cfg = build_cfg();
        cfg.set_aggr_indices(true);
        let triples: Vec<[u64; 3]> = (10..40).flat_map(|o| [[1, 0, o], [2, 0, o]]).collect();
        let kb = build(dir.path(), cfg, &triples);
        assert!(kb.stats().aggr_indices);
        let mut q = kb.query().unwrap();

        // two subjects for sixty pairs
        assert_eq!(q.is_aggregated(Permutation::Pso, -1, 0, -1).unwrap(), 2);
        assert_eq!(q.is_aggregated(Permutation::Pso, 1, 0, -1).unwrap(), 1);
        assert_eq!(q.is_aggregated(Permutation::Spo, 1, 0, -1).unwrap(), 0);

        let mut pso = q.get(Permutation::Pso, -1, 0, -1).unwrap();
        let got = pairs(&mut pso);
        assert_eq!(got.len(), 60);
        assert_eq!(got[0], (1, 10));
        assert_eq!(got[59], (2, 39));

        let mut one = q.get(Permutation::Pso, 2, 0, -1).unwrap();
        let got = pairs(&mut one);
        assert_eq!(got.len(), 30);
        assert!(got.iter().all(|(s, _)| *s == 2));
        assert_eq!(q.get_card(-1, 0, -1).unwrap(), 60);
        assert!(q.counters().aggr > 0);
    }

    #[test]
    fn test_incomplete_reverse_permutations() {
        let dir = tempdir().unwrap();
        let mut cfg = build_cfg();
        cfg.set_incomplete_indices(true);
        let kb = build(dir.path(), cfg, &BASE);
        let mut q = kb.query().unwrap();

        // the SOP table of subject 2 holds a single pair and was skipped
        assert_eq!(q.is_reverse(Permutation::Sop, 2, -1, -1).unwrap(), 1);
        assert_eq!(q.is_reverse(Permutation::Sop, 1, -1, -1).unwrap(), 0);
        assert_eq!(q.is_reverse(Permutation::Sop, -1, -1, -1).unwrap(), 3);

        let mut sop = q.get(Permutation::Sop, 2, -1, -1).unwrap();
        assert_eq!(pairs(&mut sop), vec![(3, 1)]);
        assert!(q.counters().reversed > 0);

        let mut scan = q.get(Permutation::Sop, -1, -1, -1).unwrap();
        let got: Vec<_> = scan
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| [t.0, t.1, t.2])
            .collect();
        assert_eq!(got, vec![[1, 2, 1], [1, 3, 1], [2, 3, 1]]);
        assert_eq!(q.get_card(2, -1, -1).unwrap(), 1);
    }

    #[test]
    fn test_single_index_reorders_on_demand() {
        let dir = tempdir().unwrap();
        let mut cfg = build_cfg();
        cfg.set_n_indices(1);
        let kb = build(dir.path(), cfg, &BASE);
        let cache = tempdir().unwrap();

        let mut q = kb.query().unwrap();
        q.set_reorder_cache(Some(cache.path().to_path_buf()));
        let mut pos = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        let got: Vec<_> = pos
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| [t.0, t.1, t.2])
            .collect();
        assert_eq!(got, vec![[1, 2, 1], [1, 3, 1], [1, 3, 2]]);
        assert_eq!(q.get_card(-1, 1, -1).unwrap(), 3);
        assert!(matches!(
            q.get_term_list(Permutation::Pos),
            Err(TridentError::Unsupported(_))
        ));
        assert!(std::fs::read_dir(cache.path()).unwrap().count() > 0);
        drop(q);

        // served from the side file
        let mut q = kb.query().unwrap();
        q.set_reorder_cache(Some(cache.path().to_path_buf()));
        let mut pos = q.get(Permutation::Pos, -1, 1, -1).unwrap();
        assert_eq!(pairs(&mut pos).len(), 3);

        // updates are visible through the reordering
        kb.apply_update(DiffKind::Addition, vec![[4, 1, 2]]).unwrap();
        let mut q = kb.query().unwrap();
        q.set_reorder_cache(Some(cache.path().to_path_buf()));
        let mut pos = q.get(Permutation::Pos, -1, 1, 2).unwrap();
        assert_eq!(pairs(&mut pos), vec![(2, 1), (2, 4)]);
    }

    #[test]
    fn test_querier_threads_share_one_kb() {
        let dir = tempdir().unwrap();
        let triples: Vec<[u64; 3]> = (0..200).map(|i| [i % 20, 100 + i % 3, 200 + i]).collect();
        let kb = build(dir.path(), build_cfg(), &triples);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let kb = &kb;
                scope.spawn(move || {
                    let mut q = kb.query().unwrap();
                    for s in (t..20).step_by(4) {
                        assert_eq!(q.get_card(s, -1, -1).unwrap(), 10);
                        let mut itr = q.get(Permutation::Spo, s, -1, -1).unwrap();
                        assert_eq!(pairs(&mut itr).len(), 10);
                    }
                });
            }
        });
        assert!(kb.query_stats().per_perm[Permutation::Spo.index()] >= 20);
    }

    fn pattern(choice: [i64; 3]) -> [i64; 3] {
        // values above the domain stand for variables
        choice.map(|v| if v > 5 { -1 } else { v })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn test_matches_a_set_model(
            base in vec([0i64..6, 0i64..6, 0i64..6], 1..40),
            added in vec([0i64..6, 0i64..6, 0i64..6], 0..12),
            removed in vec([0i64..6, 0i64..6, 0i64..6], 0..12),
            patterns in vec([0i64..9, 0i64..9, 0i64..9], 1..12),
        ) {
            let dir = tempdir().unwrap();
            let rows: Vec<[u64; 3]> = base.iter().map(|t| t.map(|v| v as u64)).collect();
            let kb = build(dir.path(), build_cfg(), &rows);
            kb.apply_update(DiffKind::Addition, added.clone()).unwrap();
            kb.apply_update(DiffKind::Deletion, removed.clone()).unwrap();

            let mut model: BTreeSet<[i64; 3]> = base.iter().chain(added.iter()).copied().collect();
            for t in &removed {
                model.remove(t);
            }

            let mut q: Querier = kb.query().unwrap();
            assert_eq!(q.get_input_size(), model.len() as u64);
            for choice in patterns {
                let [s, p, o] = pattern(choice);
                let expected: Vec<[i64; 3]> = model
                    .iter()
                    .filter(|t| [s, p, o].iter().zip(t.iter()).all(|(c, v)| *c < 0 || c == v))
                    .copied()
                    .collect();
                let perm = q.get_index(s, p, o);
                let mut itr = q.get(perm, s, p, o).unwrap();
                assert_eq!(triples_of(perm, &mut itr), expected);
                assert_eq!(q.get_card(s, p, o).unwrap(), expected.len() as u64);
            }
        }
    }
}
