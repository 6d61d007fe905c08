//! Input and output file collection

use std::collections::BTreeMap;
use std::path::{Component, Path};

use glob::{MatchOptions, Pattern};
use tracing::debug;

use rivet_cache::digest::hash_file;
use rivet_cache::InputFile;

use crate::error::InputError;

/// Inputs used when a task declares none
const DEFAULT_INPUTS: &str = "**/*";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// Hash the input files of a task.
///
/// `inputs` are globs relative to `package_dir`; with none, every file of
/// the package outside hidden directories is an input. Files covered by
/// `outputs` are never inputs. Returned paths are relative to `root_dir`
/// with `/` separators, sorted by path.
pub fn gather_input_hashes(
    root_dir: &Path,
    package_dir: &Path,
    inputs: &[String],
    outputs: &[String],
) -> Result<Vec<InputFile>, InputError> {
    let defaulted = inputs.is_empty();
    let patterns: Vec<String> = if defaulted {
        vec![DEFAULT_INPUTS.to_string()]
    } else {
        inputs.to_vec()
    };
    let exclusions = OutputMatcher::new(outputs)?;

    let mut hashes = BTreeMap::new();
    for relative in matching_files(package_dir, &patterns)? {
        if defaulted && is_hidden(&relative) {
            continue;
        }
        if exclusions.matches(&relative) {
            continue;
        }

        let path = package_dir.join(&relative);
        let digest = hash_file(&path).map_err(|e| InputError::Io {
            path: path.clone(),
            source: e,
        })?;
        let key = match path.strip_prefix(root_dir) {
            Ok(from_root) => to_slash(from_root),
            Err(_) => relative,
        };
        hashes.insert(key, digest.hash);
    }

    debug!(package = %package_dir.display(), files = hashes.len(), "hashed inputs");
    Ok(hashes
        .into_iter()
        .map(|(path, hash)| InputFile::new(path, hash))
        .collect())
}

/// Expand declared outputs into package-relative file paths.
///
/// Literal paths are kept as written so a missing output is reported when
/// the result is stored; globs expand to the files they currently match.
pub fn resolve_outputs(package_dir: &Path, outputs: &[String]) -> Result<Vec<String>, InputError> {
    let mut files = Vec::new();
    for output in outputs {
        if is_glob(output) {
            files.extend(matching_files(package_dir, std::slice::from_ref(output))?);
        } else {
            files.push(normalize(output));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Package-relative files matched by any of `patterns`
fn matching_files(package_dir: &Path, patterns: &[String]) -> Result<Vec<String>, InputError> {
    let base = Pattern::escape(&package_dir.to_string_lossy());
    let mut files = Vec::new();

    for pattern in patterns {
        let full = format!("{}/{}", base, pattern.trim_start_matches("./"));
        let paths = glob::glob_with(&full, MATCH_OPTIONS).map_err(|e| InputError::Pattern {
            pattern: pattern.clone(),
            source: e,
        })?;

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable path");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(package_dir) {
                files.push(to_slash(relative));
            }
        }
    }
    Ok(files)
}

/// Declared outputs as exclusion rules for inputs
struct OutputMatcher {
    patterns: Vec<Pattern>,
    prefixes: Vec<String>,
}

impl OutputMatcher {
    fn new(outputs: &[String]) -> Result<Self, InputError> {
        let mut patterns = Vec::new();
        let mut prefixes = Vec::new();
        for output in outputs {
            if is_glob(output) {
                let pattern = Pattern::new(output.trim_start_matches("./")).map_err(|e| {
                    InputError::Pattern {
                        pattern: output.clone(),
                        source: e,
                    }
                })?;
                patterns.push(pattern);
            } else {
                prefixes.push(normalize(output));
            }
        }
        Ok(Self { patterns, prefixes })
    }

    fn matches(&self, relative: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(relative, MATCH_OPTIONS))
            || self.prefixes.iter().any(|prefix| {
                relative == prefix
                    || relative
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

fn is_glob(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn is_hidden(relative: &str) -> bool {
    relative.split('/').any(|part| part.starts_with('.'))
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_end_matches('/').to_string()
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, contents: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn paths(files: &[InputFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        let pkg = temp.path().join("packages/core");
        write(&pkg, "src/lib.ts", "export {}");
        write(&pkg, "src/util.ts", "export const x = 1");
        write(&pkg, "package.json", "{}");
        write(&pkg, ".turbo/log.txt", "hidden");
        write(&pkg, "dist/index.js", "built");
        temp
    }

    #[test]
    fn test_default_inputs_skip_hidden_and_outputs() {
        let temp = fixture();
        let pkg = temp.path().join("packages/core");

        let files =
            gather_input_hashes(temp.path(), &pkg, &[], &["dist".to_string()]).unwrap();

        assert_eq!(
            paths(&files),
            vec![
                "packages/core/package.json",
                "packages/core/src/lib.ts",
                "packages/core/src/util.ts",
            ]
        );
    }

    #[test]
    fn test_declared_inputs() {
        let temp = fixture();
        let pkg = temp.path().join("packages/core");

        let files =
            gather_input_hashes(temp.path(), &pkg, &["src/**/*.ts".to_string()], &[]).unwrap();

        assert_eq!(
            paths(&files),
            vec!["packages/core/src/lib.ts", "packages/core/src/util.ts"]
        );
    }

    #[test]
    fn test_output_glob_excluded() {
        let temp = fixture();
        let pkg = temp.path().join("packages/core");

        let files =
            gather_input_hashes(temp.path(), &pkg, &[], &["**/*.js".to_string()]).unwrap();

        assert!(!paths(&files).contains(&"packages/core/dist/index.js"));
    }

    #[test]
    fn test_hash_changes_with_content() {
        let temp = fixture();
        let pkg = temp.path().join("packages/core");
        let inputs = vec!["src/lib.ts".to_string()];

        let before = gather_input_hashes(temp.path(), &pkg, &inputs, &[]).unwrap();
        write(&pkg, "src/lib.ts", "export const changed = true");
        let after = gather_input_hashes(temp.path(), &pkg, &inputs, &[]).unwrap();

        assert_eq!(before.len(), 1);
        assert_ne!(before[0].hash, after[0].hash);
    }

    #[test]
    fn test_invalid_pattern() {
        let temp = fixture();
        let pkg = temp.path().join("packages/core");

        let result = gather_input_hashes(temp.path(), &pkg, &["src/[".to_string()], &[]);
        assert!(matches!(result, Err(InputError::Pattern { .. })));
    }

    #[test]
    fn test_resolve_outputs() {
        let temp = fixture();
        let pkg = temp.path().join("packages/core");
        write(&pkg, "dist/types.d.ts", "types");

        let outputs = resolve_outputs(
            &pkg,
            &["dist/*.js".to_string(), "./build/report.txt".to_string()],
        )
        .unwrap();

        assert_eq!(outputs, vec!["build/report.txt", "dist/index.js"]);
    }

    #[test]
    fn test_output_prefix_does_not_match_sibling() {
        let matcher = OutputMatcher::new(&["dist".to_string()]).unwrap();
        assert!(matcher.matches("dist"));
        assert!(matcher.matches("dist/index.js"));
        assert!(!matcher.matches("distribution/readme.md"));
    }
}
