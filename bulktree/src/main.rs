use std::path::Path;
use std::time::Instant;

use bulktree::btree::{BTree, dump};
use bulktree::config::BuildConfig;
use bulktree::entry::{self, Entry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulktree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables, then positional arguments
    let config = match BuildConfig::from_env().and_then(|c| c.with_args(std::env::args().skip(1)))
    {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: data_file={}, tree_file={}, block_size={}, workers={}",
        config.data_file.display(),
        config.tree_file.display(),
        config.block_size,
        config.workers
    );

    if let Err(e) = run(&config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &BuildConfig) -> Result<(), Box<dyn std::error::Error>> {
    let entries = load_entries(config)?;

    create_parent_dir(&config.tree_file)?;
    create_parent_dir(&config.dump_file)?;

    let mut tree = BTree::init(&config.tree_file, &config.tree_options())?;

    let start = Instant::now();
    let root = tree.bulkload_parallel(&entries, config.workers)?;
    let elapsed = start.elapsed();
    tracing::info!(
        "Built tree over {} entries in {:.3} ms (root={root}, height={})",
        entries.len(),
        elapsed.as_secs_f64() * 1000.0,
        tree.height()
    );

    let stats = tree.verify()?;
    tracing::info!(
        "Verified tree: height={}, nodes_per_level={:?}, entries={}",
        stats.height,
        stats.nodes_per_level,
        stats.entries
    );

    dump::write_tree_to_path(&mut tree, &config.dump_file)?;
    tracing::info!("Wrote tree dump to {}", config.dump_file.display());

    tree.close()?;
    Ok(())
}

fn load_entries(config: &BuildConfig) -> Result<Vec<Entry>, entry::EntryError> {
    let mut entries = entry::load_csv(&config.data_file, config.num_points)?;
    tracing::info!(
        "Loaded {} entries from {}",
        entries.len(),
        config.data_file.display()
    );

    if !entry::is_sorted_by_key(&entries) {
        tracing::warn!("Input is not sorted by key, sorting before bulk load");
        entry::sort_by_key(&mut entries);
    }
    Ok(entries)
}

fn create_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
