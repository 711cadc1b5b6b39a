//! 解析器とラティス周りのテスト

use crate::analyzer::path::AnalysisPath;
use crate::test_utils::{build_dict, make_analyzer, read_one, surfaces, top1_tokens};
use crate::trainer::{SoftConfidenceWeighted, TrainingConfig};

#[test]
fn test_zero_weight_decoding_breaks_ties_by_insertion_order() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    let scw = SoftConfidenceWeighted::new(&config);

    analyzer.reset_for_input("ももももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();
    analyzer.compute_scores(&scw.scorer_def()).unwrap();

    let tokens = top1_tokens(&analyzer);
    assert_eq!(surfaces(&tokens), vec!["も", "もも", "もも"]);
}

#[test]
fn test_lattice_shape() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);

    analyzer.reset_for_input("ももももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();

    let lattice = analyzer.lattice();
    // 5 characters + 2 BOS boundaries + EOS
    assert_eq!(lattice.created_boundary_count(), 8);
    // boundary 2 hosts both もも and も
    assert_eq!(lattice.boundary(2).starts().num_entries(), 2);
    // the last character only fits も
    assert_eq!(lattice.boundary(6).starts().num_entries(), 1);
    // EOS is a single node
    assert_eq!(lattice.boundary(7).starts().num_entries(), 1);
    // both もも(5-7) and も(6-7) end at EOS
    assert_eq!(lattice.boundary(7).ends().node_ptrs().len(), 2);
}

#[test]
fn test_out_of_order_steps_are_rejected() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    assert!(analyzer.prepare_node_seeds().is_err());
    analyzer.reset_for_input("もも").unwrap();
    assert!(analyzer.build_lattice().is_err());
    analyzer.prepare_node_seeds().unwrap();
    assert!(analyzer.bootstrap_analysis().is_err());
}

#[test]
fn test_disconnected_lattice_is_an_error() {
    let dict = build_dict("もも,N,0\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    let scw = SoftConfidenceWeighted::new(&config);
    // もも covers 2-4 and 3-5 of ももも, but nothing ends at 3,
    // so no connection chain reaches EOS
    analyzer.reset_for_input("ももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();
    assert!(analyzer.compute_scores(&scw.scorer_def()).is_err());
}

#[test]
fn test_no_node_reaches_eos_is_an_error() {
    let dict = build_dict("も,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    // モ is not in the dictionary and there is no UNK template
    analyzer.reset_for_input("もモ").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    assert!(analyzer.build_lattice().is_err());
}

#[test]
fn test_unknown_nodes_cover_unseen_scripts() {
    let dict = build_dict("UNK,N,10\nもも,N,0\nも,PRT,1\nモ,PRT,2\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    let scw = SoftConfidenceWeighted::new(&config);

    analyzer.reset_for_input("モモももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();
    analyzer.compute_scores(&scw.scorer_def()).unwrap();

    // boundary 2 hosts the unknown モ and モモ plus the dictionary モ
    let starts = analyzer.lattice().boundary(2).starts();
    assert!(starts.num_entries() >= 3);
    let mut unk_surface_ids = vec![];
    for pos in 0..starts.num_entries() {
        let row = starts.entry_row(pos);
        if row[0] < 0 {
            unk_surface_ids.push(row[0]);
        }
    }
    // unknown surface ids are hashed and never collide with dictionary ids
    assert!(!unk_surface_ids.is_empty());
}

#[test]
fn test_top1_walker_yields_total_nodes() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    let scw = SoftConfidenceWeighted::new(&config);

    analyzer.reset_for_input("ももももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();
    analyzer.compute_scores(&scw.scorer_def()).unwrap();

    let mut path = AnalysisPath::default();
    path.fill_in(analyzer.lattice()).unwrap();
    assert_eq!(path.total_nodes(), 3);
    assert_eq!(path.nodes().len(), 3);

    // the top-1 path is も(2-3), もも(3-5), もも(5-7)
    assert!(path.move_to_boundary(3));
    let ptr = path.next_node().unwrap();
    assert_eq!(ptr.boundary, 3);
    assert!(path.next_node().is_none());

    assert!(!path.move_to_boundary(4));
    assert!(path.move_to_boundary(2));
    assert_eq!(path.next_node().unwrap().boundary, 2);
}

#[test]
fn test_walker_requires_computed_scores() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    analyzer.reset_for_input("もも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();

    let mut path = AnalysisPath::default();
    assert!(path.fill_in(analyzer.lattice()).is_err());
}

#[test]
fn test_decoding_is_deterministic() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut analyzer = make_analyzer(&dict, &config);
    let scw = SoftConfidenceWeighted::new(&config);

    analyzer.reset_for_input("ももももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();

    analyzer.compute_scores(&scw.scorer_def()).unwrap();
    let first = analyzer.top1_node_ptrs().unwrap();
    let connections = analyzer.lattice().num_connections();

    analyzer.compute_scores(&scw.scorer_def()).unwrap();
    let second = analyzer.top1_node_ptrs().unwrap();

    assert_eq!(first, second);
    assert_eq!(analyzer.lattice().num_connections(), connections);
}

#[test]
fn test_global_beam_keeps_the_best_path_on_toy_input() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default().global_beam(2, 1, 1);
    let mut analyzer = make_analyzer(&dict, &config);
    analyzer.set_global_beam(config.global_beam);
    let scw = SoftConfidenceWeighted::new(&config);

    analyzer.reset_for_input("ももももも").unwrap();
    analyzer.prepare_node_seeds().unwrap();
    analyzer.build_lattice().unwrap();
    analyzer.bootstrap_analysis().unwrap();
    analyzer.compute_scores(&scw.scorer_def()).unwrap();

    // with zero weights the pruned decode still reaches EOS
    assert!(!analyzer.top1_node_ptrs().unwrap().is_empty());
}

#[test]
fn test_mark_gold_enumerates_matching_nodes() {
    let dict = build_dict("もも,N,0\nも,PRT,1\n");
    let config = TrainingConfig::default();
    let mut trainer = crate::test_utils::make_trainer(&dict, &config);
    let example = read_one(
        &dict,
        ",もも,pos:N,subpos:0\n,も,pos:PRT,subpos:1\n,もも,pos:N,subpos:0\n\n",
    );
    trainer.set_example(example);
    trainer.prepare().unwrap();

    let mut gold = vec![];
    trainer.mark_gold(|ptr| gold.push((ptr.boundary, ptr.position)));
    // もも(2-4), も(4-5), もも(5-7) and nothing else
    assert_eq!(gold, vec![(2, 0), (4, 1), (5, 0)]);
}
