use sqfs_boot::{EntryType, SquashFs};
use std::{env, fs, io, path::Path};

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: {} <squashfs-file> <output-dir>", args[0]);
        return Ok(());
    }

    let input_file = &args[1];
    let output_dir = &args[2];

    // Probe the squashfs image
    let fs = SquashFs::from_path(input_file)?;
    println!(
        "{} compression, {} byte blocks, {} inodes",
        fs.compression(),
        fs.block_size(),
        fs.inode_count()
    );

    // Create output directory if it doesn't exist
    fs::create_dir_all(output_dir)?;

    // Start recursive extraction from root
    extract_recursive(&fs, "/", Path::new(output_dir))?;

    Ok(())
}

/// Recursively extract the regular files below `current_path`.
fn extract_recursive<D: sqfs_boot::BlockDevice>(
    fs: &SquashFs<D>,
    current_path: &str,
    output_dir: &Path,
) -> io::Result<()> {
    for entry in fs.opendir(current_path)? {
        let entry = entry?;
        let path = format!("{}/{}", current_path.trim_end_matches('/'), entry.name());
        let out_path = output_dir.join(entry.name());

        match entry.file_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out_path)?;
                extract_recursive(fs, &path, &out_path)?;
            }
            EntryType::File => {
                println!("Extracting: {path} ({} bytes)", entry.size());
                fs::write(&out_path, fs.read_to_vec(&path)?)?;
            }
            other => println!("Skipping: {path} ({other:?})"),
        }
    }

    Ok(())
}
