//! Weights survive a trip through the graph runtime's naming and a JSON file.

use orsino::{
    Direction, Module, NamedArrays, OrsinoError, SpecialTokens, Transformer, TransformerConfig,
    WeightBridge,
};

fn config(seed: u64) -> TransformerConfig {
    TransformerConfig {
        src_vocab_size: 12,
        tgt_vocab_size: 11,
        embed_size: 8,
        num_heads: 2,
        num_layers: 2,
        ff_size: 6,
        max_seq_length: 7,
        dropout: 0.0,
        layer_norm_eps: 1e-5,
        seed,
    }
}

#[test]
fn ported_model_reproduces_outputs() {
    let source = Transformer::new(config(3)).unwrap();
    let bridge = WeightBridge::for_config(&source.config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ported.json");
    bridge.export_from(&source).unwrap().save_json(&path).unwrap();
    let archive = NamedArrays::load_json(&path).unwrap();

    assert!(archive.contains("Embedding.E.1"));
    assert!(archive.contains("decoder:Norm.B.5"));
    assert!(!archive.contains("positional_encoding.pe"));

    let mut target = Transformer::new(config(4)).unwrap();
    let copied = bridge.import_into(&archive, &mut target).unwrap();
    assert_eq!(copied, source.named_parameters().len());

    let src = vec![vec![4, 5, 6, 0, 0], vec![7, 8, 9, 10, 11]];
    let tgt = vec![vec![1, 3, 4, 5, 0], vec![1, 6, 0, 0, 0]];
    let tokens = SpecialTokens { start: 1, end: 2, src_pad: 0, tgt_pad: 0 };
    let (expected, _) = source.forward(&src, &tgt, tokens.masks()).unwrap();
    let (actual, _) = target.forward(&src, &tgt, tokens.masks()).unwrap();
    assert_eq!(actual, expected);

    assert_eq!(
        target.generate_batch(&src, tokens).unwrap(),
        source.generate_batch(&src, tokens).unwrap()
    );
}

#[test]
fn archive_from_a_different_geometry_is_rejected() {
    let deep = Transformer::new(config(0)).unwrap();
    let archive = WeightBridge::for_config(&deep.config)
        .unwrap()
        .export_from(&deep)
        .unwrap();

    let shallow_config = TransformerConfig {
        num_layers: 1,
        ..config(0)
    };
    let mut shallow = Transformer::new(shallow_config.clone()).unwrap();
    let before = shallow.state_dict();
    let bridge = WeightBridge::for_config(&shallow_config).unwrap();

    match bridge.import_into(&archive, &mut shallow) {
        Err(OrsinoError::BridgeMismatch { unmapped_remote, missing_remote, .. }) => {
            assert!(unmapped_remote.contains(&"encoder:MHA.Wq.1".to_string()));
            assert!(unmapped_remote.contains(&"decoder:Norm.A.5".to_string()));
            assert!(missing_remote.is_empty());
        }
        other => panic!("expected a name mismatch, got {:?}", other),
    }
    assert_eq!(shallow.state_dict(), before);
}

#[test]
fn conversion_round_trips_names() {
    let model = Transformer::new(config(9)).unwrap();
    let bridge = WeightBridge::for_config(&model.config).unwrap();
    let local = model.state_dict();

    let remote = bridge.convert(&local, Direction::LocalToRemote).unwrap();
    let back = bridge.convert(&remote, Direction::RemoteToLocal).unwrap();
    assert_eq!(back, local);
}
