use lockscope::symbolization::{FrameResolver, Symbolizer};

#[test]
fn test_symbolizer_creation() {
    let binary_path = env!("CARGO_BIN_EXE_lockscope");

    let symbolizer = Symbolizer::new(binary_path);
    assert!(symbolizer.is_ok(), "Failed to create symbolizer: {:?}", symbolizer.err());
}

#[test]
fn test_symbolizer_rejects_non_binaries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-an-elf");
    std::fs::write(&path, b"--- contention\n").unwrap();
    assert!(Symbolizer::new(&path).is_err());
    assert!(Symbolizer::new(dir.path().join("missing")).is_err());
}

#[test]
fn test_symbolizer_resolves_function_names() {
    let binary_path = env!("CARGO_BIN_EXE_lockscope");
    let symbolizer = Symbolizer::new(binary_path).expect("Failed to create symbolizer");

    // Function addresses from nm; skip the test where binutils is missing
    let Ok(nm_output) = std::process::Command::new("nm").arg(binary_path).output() else {
        return;
    };
    let symbols = String::from_utf8_lossy(&nm_output.stdout);

    let addresses: Vec<u64> = symbols
        .lines()
        .filter(|line| line.contains(" T ") && line.contains("lockscope"))
        .filter_map(|line| u64::from_str_radix(line.split_whitespace().next()?, 16).ok())
        .take(10)
        .collect();
    if addresses.is_empty() {
        return;
    }

    let resolved: Vec<_> = addresses.iter().map(|&addr| symbolizer.resolve(addr)).collect();
    assert!(
        resolved.iter().any(|frame| !frame.is_unknown()),
        "Symbolizer should resolve at least one of {} addresses; missing debug symbols?",
        addresses.len()
    );
    // resolution is cached: a second lookup gives the same answer
    assert_eq!(symbolizer.resolve(addresses[0]), resolved[0]);
}

#[test]
#[ignore] // Depends on the build carrying line tables
fn test_dwarf_line_info_available() {
    let binary_path = env!("CARGO_BIN_EXE_lockscope");
    let symbolizer = Symbolizer::new(binary_path).expect("Failed to create symbolizer");
    let nm_output = std::process::Command::new("nm").arg(binary_path).output().expect("Failed to run nm");
    let symbols = String::from_utf8_lossy(&nm_output.stdout);

    let found = symbols
        .lines()
        .filter(|line| line.contains(" T "))
        .filter_map(|line| u64::from_str_radix(line.split_whitespace().next()?, 16).ok())
        .take(50)
        .any(|addr| {
            symbolizer
                .resolve(addr)
                .frames
                .iter()
                .any(|f| f.location.as_ref().is_some_and(|l| l.file.is_some() && l.line.is_some()))
        });
    assert!(found, "No source location found - DWARF line info not available in this build");
}
