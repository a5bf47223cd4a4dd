//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use rs_lm_core::config::LmConfig;
use rs_lm_core::model::{ModelFileType, NgramModel};

/// Trigram model over `<s> <UNK> DOG CAT </s>`.
pub const PET_ARPA: &str = "\
\\data\\
ngram 1=5
ngram 2=3
ngram 3=1

\\1-grams:
-1.0000 <s>\t-0.3000
-1.0000 <UNK>\t-0.2500
-0.5000 DOG\t-0.2000
-0.6000 CAT\t-0.1000
-0.7000 </s>\t0.0000

\\2-grams:
-0.6990 <s> DOG -0.1500
-0.5000 <UNK> DOG -0.1200
-0.6990 DOG CAT -0.0500

\\3-grams:
-0.2000 <s> DOG CAT

\\end\\
";

/// Two unigrams and a single bigram that starts with the sentence end.
pub const BOUNDARY_ARPA: &str = "\
\\data\\
ngram 1=2
ngram 2=1

\\1-grams:
-0.3010 <s>\t-0.1000
-0.3010 </s>\t-0.1000

\\2-grams:
-0.3010 </s> <s>

\\end\\
";

pub fn write_file(dir: &Path, name: &str, text: &str) -> PathBuf {
	let path = dir.join(name);
	fs::write(&path, text).expect("write fixture");
	path
}

pub fn pet_model(dir: &Path) -> NgramModel {
	let path = write_file(dir, "pets.arpa", PET_ARPA);
	NgramModel::read(&path, ModelFileType::Arpa, &LmConfig::default()).expect("read pet model")
}

/// `|a - b| <= tolerance`, with a readable failure.
pub fn assert_close(a: i32, b: i32, tolerance: i32) {
	assert!((a - b).abs() <= tolerance, "{a} and {b} differ by more than {tolerance}");
}
