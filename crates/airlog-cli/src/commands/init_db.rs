use std::path::Path;

use airlog_core::Store;

pub fn run(db: &Path) {
    let store = match Store::open(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot open {}: {e}", db.display());
            std::process::exit(1);
        }
    };
    let existed = store.is_initialized();
    if let Err(e) = store.create_schema() {
        eprintln!("Creating schema failed: {e}");
        std::process::exit(1);
    }

    if existed {
        println!("Database {} already initialized", db.display());
    } else {
        println!("Initialized database {}", db.display());
    }
    match store.count() {
        Ok(n) => println!("  {n} readings stored"),
        Err(e) => eprintln!("  Counting readings failed: {e}"),
    }
}
