//! Command-line configuration.
//!
//! Linker drivers pass arguments in a meaningful order: `-lc` only resolves
//! against search paths seen so far, and `-Bstatic`/`-Bdynamic` toggle how
//! later libraries are found. Clap cannot preserve that order, so all
//! positionals are captured as-is and scanned manually.
//!
//! ld option spelling is inconsistent: short options take their parameter
//! attached or as the next argument, long options start with `-` or `--`
//! and take parameters after `=` or as the next argument. The scan handles
//! all four shapes.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use crate::error::{ErrorKind, LinkError, Result};
use crate::linker::LinkerOptions;

/// A static link editor for x86_64 ELF binaries.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Config {
    /// All arguments (files, -o, -e, -l, -L, ...) in order.
    #[arg(required = true, allow_hyphen_values = true, num_args = 1..)]
    pub args: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opt {
    Ignore,
    SetOutputFileName,
    SetEntrySymbolName,
    SearchForLibrary,
    AddLibrarySearchPath,
    DisableSharedLinking,
    EnableSharedLinking,
    PushState,
    PopState,
    EnableEhFrameHdr,
    DisableEhFrameHdr,
    BuildId,
    Keyword,
    Unrecognized,
}

#[derive(Debug, Clone, Copy)]
struct OptSpec {
    opt: Opt,
    has_arg: bool,
}

fn short_option(letter: char) -> Option<OptSpec> {
    let spec = |opt, has_arg| Some(OptSpec { opt, has_arg });
    match letter {
        'o' => spec(Opt::SetOutputFileName, true),
        'e' => spec(Opt::SetEntrySymbolName, true),
        'l' => spec(Opt::SearchForLibrary, true),
        'L' => spec(Opt::AddLibrarySearchPath, true),
        'z' => spec(Opt::Keyword, true),
        'm' => spec(Opt::Ignore, true),
        _ => None,
    }
}

fn long_option(name: &str) -> OptSpec {
    let (opt, has_arg) = match name {
        "output" => (Opt::SetOutputFileName, true),
        "entry" => (Opt::SetEntrySymbolName, true),
        "library" => (Opt::SearchForLibrary, true),
        "library-path" => (Opt::AddLibrarySearchPath, true),
        "Bstatic" | "non_shared" | "dn" | "static" => (Opt::DisableSharedLinking, false),
        "Bdynamic" | "dy" | "call_shared" => (Opt::EnableSharedLinking, false),
        "push-state" | "push_state" => (Opt::PushState, false),
        "pop-state" | "pop_state" => (Opt::PopState, false),
        "eh-frame-hdr" => (Opt::EnableEhFrameHdr, false),
        "no-eh-frame-hdr" => (Opt::DisableEhFrameHdr, false),
        "build-id" => (Opt::BuildId, true),
        "start-group" | "end-group" => (Opt::Ignore, false),
        "plugin" | "plugin-opt" | "dynamic-linker" | "hash-style" => (Opt::Ignore, true),
        "add-needed" | "no-add-needed" | "as-needed" | "no-as-needed" => (Opt::Ignore, false),
        "no-dynamic-linker" | "nostdlib" => (Opt::Ignore, false),
        _ => (Opt::Unrecognized, false),
    };
    OptSpec { opt, has_arg }
}

struct SplitOption<'a> {
    spec: OptSpec,
    param: &'a str,
    /// Arguments consumed by the parameter (0 or 1).
    consumed: usize,
    /// Whether the parameter was attached with `=` or glued to the letter.
    attached: bool,
}

fn split_option<'a>(arg: &'a str, args: &'a [String], index: usize) -> SplitOption<'a> {
    let next = || args.get(index + 1).map(String::as_str).unwrap_or("");

    let parse_long = |name: &'a str| -> SplitOption<'a> {
        match name.split_once('=') {
            Some((name, param)) => {
                SplitOption { spec: long_option(name), param, consumed: 0, attached: true }
            }
            None => {
                SplitOption { spec: long_option(name), param: next(), consumed: 1, attached: false }
            }
        }
    };

    let mut chars = arg.chars();
    chars.next(); // leading '-'
    let letter = chars.next().unwrap_or('-');
    if letter == '-' {
        return parse_long(&arg[2..]);
    }
    let Some(spec) = short_option(letter) else {
        return parse_long(&arg[1..]);
    };
    if arg.len() > 2 {
        SplitOption { spec, param: &arg[2..], consumed: 0, attached: true }
    } else {
        SplitOption { spec, param: next(), consumed: 1, attached: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BState {
    Dynamic,
    Static,
}

impl Config {
    /// Scans the captured arguments in order and resolves `-l` libraries
    /// against the `-L` paths seen so far.
    pub fn parse_inputs(&self) -> Result<(LinkerOptions, Vec<PathBuf>)> {
        let mut options = LinkerOptions::default();
        let mut files: Vec<PathBuf> = Vec::with_capacity(self.args.len());

        let mut bstate = BState::Dynamic;
        let mut bstate_stack: Vec<BState> = Vec::new();
        // (index into `files`, state at that point)
        let mut libraries: Vec<(usize, BState)> = Vec::new();
        let mut search_paths: Vec<PathBuf> = Vec::new();

        let mut index = 0;
        while index < self.args.len() {
            let arg = &self.args[index];
            index += 1;

            if arg.len() < 2 || !arg.starts_with('-') {
                files.push(PathBuf::from(arg));
                continue;
            }
            if arg == "--" {
                break;
            }

            let split = split_option(arg, &self.args, index - 1);
            if split.spec.has_arg {
                index += split.consumed;
            }

            match split.spec.opt {
                Opt::SetOutputFileName => options.output_file_name = PathBuf::from(split.param),
                Opt::SetEntrySymbolName => options.entry_symbol_name = split.param.to_string(),
                Opt::SearchForLibrary => {
                    libraries.push((files.len(), bstate));
                    files.push(PathBuf::from(split.param));
                }
                Opt::AddLibrarySearchPath => search_paths.push(PathBuf::from(split.param)),
                Opt::DisableSharedLinking => bstate = BState::Static,
                Opt::EnableSharedLinking => bstate = BState::Dynamic,
                Opt::PushState => bstate_stack.push(bstate),
                Opt::PopState => {
                    bstate = bstate_stack.pop().ok_or_else(|| {
                        LinkError::report(
                            ErrorKind::NotOk,
                            "--pop-state without a preceding --push-state",
                        )
                    })?;
                }
                Opt::EnableEhFrameHdr => options.create_eh_frame_header = true,
                Opt::DisableEhFrameHdr => options.create_eh_frame_header = false,
                Opt::BuildId => {
                    if split.attached && split.param != "none" {
                        return Err(LinkError::report(
                            ErrorKind::NotOk,
                            format!("unsupported build id: {}", split.param),
                        ));
                    }
                }
                Opt::Keyword => {
                    if !matches!(split.param, "now" | "noexecstack" | "relro") {
                        return Err(LinkError::report(
                            ErrorKind::NotOk,
                            format!("unsupported keyword: {}", split.param),
                        ));
                    }
                }
                Opt::Unrecognized => {
                    return Err(LinkError::report(
                        ErrorKind::NotOk,
                        format!("unrecognized option: {arg}"),
                    ));
                }
                Opt::Ignore => {}
            }
        }

        for (file_index, state) in libraries {
            let name = files[file_index].display().to_string();
            // Only static linking is implemented. Finding a shared library
            // while dynamic linking is in effect is a clear refusal, not a
            // silent fallback to the archive.
            if state == BState::Dynamic {
                if let Some(shared) = find_library(&name, ".so", &search_paths) {
                    return Err(LinkError::report(
                        ErrorKind::NotOk,
                        format!(
                            "refusing to link shared library {}: only static archives are supported",
                            shared.display()
                        ),
                    ));
                }
            }
            match find_library(&name, ".a", &search_paths) {
                Some(path) => {
                    info!("found -l{}: {}", name, path.display());
                    files[file_index] = path;
                }
                None => {
                    return Err(LinkError::report(
                        ErrorKind::NotOk,
                        format!("could not find: lib{name}.a"),
                    ));
                }
            }
        }

        Ok((options, files))
    }
}

fn find_library(name: &str, extension: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let file_name = format!("lib{name}{extension}");
    search_paths.iter().map(|path| path.join(&file_name)).find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        Config {
            args: args.iter().map(|s| s.to_string()).collect(),
            log_level: "warn".to_string(),
        }
    }

    #[test]
    fn ordered_scan_collects_files_and_options() {
        let config = config(&["-o", "prog", "a.o", "--entry=main", "b.o", "-znoexecstack"]);
        let (options, files) = config.parse_inputs().unwrap();
        assert_eq!(options.output_file_name, PathBuf::from("prog"));
        assert_eq!(options.entry_symbol_name, "main");
        assert_eq!(files, vec![PathBuf::from("a.o"), PathBuf::from("b.o")]);
    }

    #[test]
    fn unknown_options_and_keywords_are_fatal() {
        assert!(config(&["--definitely-not-an-option", "a.o"]).parse_inputs().is_err());
        assert!(config(&["-z", "lazy", "a.o"]).parse_inputs().is_err());
        assert!(config(&["--build-id=fast", "a.o"]).parse_inputs().is_err());
    }

    #[test]
    fn eh_frame_hdr_toggles() {
        let (options, _) = config(&["--eh-frame-hdr", "a.o"]).parse_inputs().unwrap();
        assert!(options.create_eh_frame_header);
        let (options, _) =
            config(&["--eh-frame-hdr", "--no-eh-frame-hdr", "a.o"]).parse_inputs().unwrap();
        assert!(!options.create_eh_frame_header);
    }

    #[test]
    fn pop_state_restores_the_pushed_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("libm.a"), b"not really an archive").unwrap();
        std::fs::write(dir.path().join("libm.so"), b"not really a shared object").unwrap();
        let dir_arg = dir.path().display().to_string();

        // In dynamic state the .so is found and refused.
        let cfg = config(&["-L", &dir_arg, "-lm", "a.o"]);
        assert!(cfg.parse_inputs().is_err());

        // -static switches to archives; push/pop brackets the change.
        let cfg = config(&["-L", &dir_arg, "--push-state", "-static", "-lm", "--pop-state", "a.o"]);
        let (_, files) = cfg.parse_inputs().unwrap();
        assert_eq!(files[0], dir.path().join("libm.a"));

        let cfg = config(&["--pop-state", "a.o"]);
        assert!(cfg.parse_inputs().is_err());
    }
}
