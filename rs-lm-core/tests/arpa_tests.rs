//! Integration tests for ARPA reading and writing of scoring models.

mod common;

use std::fs;

use rs_lm_core::config::LmConfig;
use rs_lm_core::model::{ModelFileType, NgramModel};
use rs_lm_core::LmError;
use tempfile::tempdir;

use common::{assert_close, pet_model, write_file, BOUNDARY_ARPA};

#[test]
fn test_written_model_reads_back() {
	let dir = tempdir().unwrap();
	let model = pet_model(dir.path());
	let out = dir.path().join("copy.arpa");
	model.write(&out, ModelFileType::Auto).unwrap();

	let text = fs::read_to_string(&out).unwrap();
	assert!(text.starts_with("This is an ARPA-format language model file"));
	assert!(text.contains("ngram 1=5\nngram 2=3\nngram 3=1\n"));

	let copy = NgramModel::read(&out, ModelFileType::Arpa, &LmConfig::default()).unwrap();
	assert_eq!(copy.order(), 3);
	assert_eq!(copy.counts(), [5, 3, 1]);
	assert_eq!(copy.n_words(), 5);
	for (w, h) in [("CAT", vec!["DOG", "<s>"]), ("CAT", vec!["DOG"]), ("</s>", vec!["CAT"]), ("DOG", vec![])] {
		assert_close(copy.score(w, &h), model.score(w, &h), 5);
	}
}

#[test]
fn test_boundary_bigrams_are_not_written() {
	let dir = tempdir().unwrap();
	let path = write_file(dir.path(), "boundary.arpa", BOUNDARY_ARPA);
	let model = NgramModel::read(&path, ModelFileType::Arpa, &LmConfig::default()).unwrap();
	assert_eq!(model.counts(), [2, 1, 0]);

	let out = dir.path().join("written.arpa");
	model.write(&out, ModelFileType::Arpa).unwrap();
	let text = fs::read_to_string(&out).unwrap();
	assert!(text.contains("ngram 2=0"));
	assert!(!text.contains("</s> <s>"));

	let copy = NgramModel::read(&out, ModelFileType::Arpa, &LmConfig::default()).unwrap();
	assert_eq!(copy.counts(), [2, 0, 0]);
	assert_eq!(copy.order(), 1);
}

#[test]
fn test_malformed_files_are_rejected() {
	let dir = tempdir().unwrap();
	let config = LmConfig::default();

	let no_data = write_file(dir.path(), "empty.arpa", "just a comment\n");
	assert!(matches!(NgramModel::read(&no_data, ModelFileType::Arpa, &config), Err(LmError::Format(_))));

	let no_unigrams = write_file(dir.path(), "zero.arpa", "\\data\\\nngram 1=0\n\n\\1-grams:\n\\end\\\n");
	assert!(matches!(NgramModel::read(&no_unigrams, ModelFileType::Arpa, &config), Err(LmError::Format(_))));

	let bad_number = write_file(dir.path(), "nan.arpa", "\\data\\\nngram 1=1\n\n\\1-grams:\nabc <s>\n\\end\\\n");
	assert!(matches!(NgramModel::read(&bad_number, ModelFileType::Arpa, &config), Err(LmError::Format(_))));
}

#[test]
fn test_declared_counts_do_not_size_the_model() {
	let dir = tempdir().unwrap();
	let text = "\\data\\\nngram 1=999999999999\nngram 2=999999999999\n\n\\1-grams:\n-1.0 <s> -0.2\n-0.5 a -0.1\n-1.0 </s>\n\n\\2-grams:\n-0.3 <s> a\n-0.2 a </s>\n\n\\end\\\n";
	let path = write_file(dir.path(), "inflated.arpa", text);
	let model = NgramModel::read(&path, ModelFileType::Arpa, &LmConfig::default()).unwrap();
	assert_eq!(model.order(), 2);
	assert_eq!(model.counts(), [3, 2, 0]);
	assert!(model.score("a", &["<s>"]) > model.score("</s>", &["<s>"]));
}
