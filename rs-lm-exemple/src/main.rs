use std::collections::BTreeSet;
use std::fs;

use rs_lm_core::arpa;
use rs_lm_core::binlm;
use rs_lm_core::config::LmConfig;
use rs_lm_core::counts::{CountModelBuilder, CountOptions, Discounting};
use rs_lm_core::model::{ModelFileType, ModelRef, NgramModel};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG=info shows the progress of readers and writers
    env_logger::init();

    let config = LmConfig::load("./data/lm.toml")?;
    fs::create_dir_all("./out")?;

    // Count every trigram of the corpus; the vocabulary is every word seen
    let corpus = fs::read_to_string("./data/corpus.txt")?;
    let vocab: BTreeSet<&str> = corpus.split_whitespace().collect();
    let vocab: Vec<&str> = vocab.into_iter().collect();

    let options = CountOptions {
        discounting: Discounting::WittenBell,
        context_cues: vec![config.symbols.start.clone()],
        ..CountOptions::default()
    };
    let mut builder = CountModelBuilder::new(3, &vocab, options, &config)?;
    for line in corpus.lines() {
        builder.add_sentence(line);
    }
    let counts = builder.build()?;
    println!("Count model: {} words, {} bigrams, {} trigrams", counts.vocab_size(), counts.num_kgrams(1), counts.num_kgrams(2));

    // Binary dump of the counts, read back to check it
    binlm::write_bin(&counts, "./out/corpus.binlm")?;
    let reloaded = binlm::read_bin("./out/corpus.binlm", &config)?;
    println!("Binary model reloaded identical: {}", reloaded == counts);

    // ARPA export; boundary n-grams such as "</s> <s>" are left out
    let session = arpa::write_arpa(&counts, "./out/corpus.arpa")?;
    for k in 1..=3 {
        println!("{k}-grams written: {} ({} skipped)", session.final_count(k), session.skipped(k));
    }

    // Scoring model from the ARPA file, with a word class on top
    let mut model = NgramModel::read("./out/corpus.arpa", ModelFileType::Arpa, &config)?;
    let n_classes = model.read_classdef("./data/classes.txt")?;
    println!("{n_classes} class(es) loaded");

    let lmath = *model.logmath();
    let sentences = ["the cat sat on the mat", "the fish sat on the bone", "a parrot chased the dog"];
    for sentence in sentences {
        let mut history: Vec<&str> = vec![config.symbols.start.as_str()];
        let mut total = 0.0;
        for word in sentence.split_whitespace().chain([config.symbols.end.as_str()]) {
            // history is most recent word first
            let recent: Vec<&str> = history.iter().rev().take(2).copied().collect();
            total += lmath.log_to_log10(model.score(word, &recent));
            history.push(word);
        }
        println!("log10 P({sentence}) = {total:.4}");
    }

    // Snapshot cache: the first call parses the ARPA file and writes
    // corpus.lmdump, the second one loads the snapshot
    let _ = fs::remove_file("./out/corpus.lmdump");
    let first = NgramModel::open_cached("./out/corpus.arpa", &config)?;
    let cached = ModelRef::new(NgramModel::open_cached("./out/corpus.arpa", &config)?);
    let holder = cached.retain();
    println!(
        "Snapshot model: {:?} n-grams, writable: {}, holders: {}",
        cached.counts(),
        cached.is_writable(),
        holder.refcount()
    );
    println!("Same trigram counts as the parsed model: {}", first.counts() == cached.counts());
    println!("Holders left after release: {}", holder.release());

    Ok(())
}
