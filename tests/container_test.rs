//! Container parsing against synthetic and damaged GGUF files.

mod common;

use pocket_llm::models::{ContainerError, GgmlType, ModelContainer, SynthConfig};

#[test]
fn test_synthetic_model_round_trips_hparams() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = SynthConfig {
        n_layers: 3,
        hidden: 96,
        n_heads: 6,
        n_kv_heads: 3,
        ffn_hidden: 160,
        context_length: 64,
        weight_type: GgmlType::F16,
        ..SynthConfig::default()
    };
    let path = common::write_model(dir.path(), "f16.gguf", &cfg);

    let model = ModelContainer::open(&path).unwrap();
    let hp = model.hparams();
    assert_eq!(hp.architecture, "llama");
    assert_eq!(hp.n_layers, 3);
    assert_eq!(hp.hidden, 96);
    assert_eq!(hp.n_heads, 6);
    assert_eq!(hp.n_kv_heads, 3);
    assert_eq!(hp.head_dim(), 16);
    assert_eq!(hp.ffn_hidden, 160);
    assert_eq!(hp.context_length, 64);
    assert_eq!(hp.quantization, GgmlType::F16);
    assert_eq!(model.file_len(), std::fs::metadata(&path).unwrap().len() as usize);
}

#[test]
fn test_tensor_table_points_inside_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write_model(dir.path(), "q4.gguf", &SynthConfig {
        weight_type: GgmlType::Q4_0,
        ..SynthConfig::default()
    });
    let model = ModelContainer::open(&path).unwrap();
    let gguf = model.gguf();
    assert_eq!(gguf.version, 3);
    for t in gguf.tensors() {
        assert!(t.end() <= model.file_len() as u64, "{} overruns the file", t.name);
        assert_eq!(t.start % gguf.alignment, 0, "{} is misaligned", t.name);
        assert_eq!(Some(t.byte_len), t.ty.byte_len(t.n_elements()));
    }
}

#[test]
fn test_missing_file_is_not_found() {
    let err = ModelContainer::open(std::path::Path::new("/nonexistent/model.gguf")).unwrap_err();
    assert!(matches!(err, ContainerError::NotFound(_)), "{:?}", err);
}

#[test]
fn test_bad_magic_is_format_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.gguf");
    let mut bytes = SynthConfig::default().writer().unwrap().to_bytes();
    bytes[..4].copy_from_slice(b"GGML");
    std::fs::write(&path, bytes).unwrap();
    assert!(matches!(ModelContainer::open(&path), Err(ContainerError::Format(_))));
}

#[test]
fn test_truncation_anywhere_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let full = SynthConfig::default().writer().unwrap().to_bytes();
    // Header, metadata, tensor table and tensor data.
    for cut in [10, 64, full.len() / 3, full.len() - 1] {
        let path = dir.path().join(format!("cut-{}.gguf", cut));
        std::fs::write(&path, &full[..cut]).unwrap();
        match ModelContainer::open(&path) {
            Err(ContainerError::Truncated { .. }) => {}
            other => panic!("cut at {}: expected Truncated, got {:?}", cut, other.map(|_| ())),
        }
    }
}

#[test]
fn test_unexecutable_tensor_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("k-quant.gguf");
    let cfg = SynthConfig::default();
    let mut writer = cfg.writer().unwrap();
    let len = GgmlType::Q4K.byte_len(256).unwrap() as usize;
    writer.add_tensor_raw("extra.weight", &[256], GgmlType::Q4K, vec![0u8; len]);
    writer.write_to(&path).unwrap();

    match ModelContainer::open(&path) {
        Err(ContainerError::UnsupportedQuantization { tensor, ty }) => {
            assert_eq!(tensor, "extra.weight");
            assert_eq!(ty, GgmlType::Q4K);
        }
        other => panic!("expected UnsupportedQuantization, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_vocabulary_specials_come_from_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::write_model(dir.path(), "v.gguf", &SynthConfig::default());
    let model = ModelContainer::open(&path).unwrap();
    let vocab = model.vocab();
    assert_eq!(vocab.special.bos, 1);
    assert_eq!(vocab.special.eos, 2);
    assert_eq!(vocab.special.unk, 0);
    assert!(vocab.add_bos);
    assert_eq!(vocab.len(), model.hparams().vocab_size);
}
