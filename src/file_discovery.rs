use crate::error::{FlattenError, Result};
use globset::{GlobBuilder, GlobMatcher};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs;

const GLOB_META: [char; 4] = ['*', '?', '[', '{'];

/// Async input discovery from a glob pattern such as `data/mdc*.xml`
///
/// Without recursion `**` behaves like `*` and only matches one path
/// component. With recursion it matches any number of directories.
#[derive(Debug, Clone)]
pub struct FileDiscovery {
    pattern: String,
    /// Literal directory prefix of the pattern, where the walk starts
    base: PathBuf,
    matcher: GlobMatcher,
    /// Maximum depth below `base` (None = unlimited)
    max_depth: Option<usize>,
    /// Follow symbolic links
    follow_symlinks: bool,
    literal: bool,
}

fn has_glob_meta(text: &str) -> bool {
    text.contains(GLOB_META)
}

impl FileDiscovery {
    /// Compile `pattern`, with `recursive` enabling `**` descent
    pub fn from_pattern(pattern: &str, recursive: bool) -> Result<Self> {
        let effective = if recursive {
            pattern.to_string()
        } else {
            pattern.replace("**", "*")
        };

        let mut base = PathBuf::new();
        let mut remainder = 0usize;
        for component in Path::new(&effective).components() {
            let text = component.as_os_str().to_string_lossy();
            if remainder == 0 && !has_glob_meta(&text) {
                base.push(component);
            } else {
                remainder += 1;
            }
        }
        let literal = remainder == 0;
        let descends = effective.contains("**");
        let max_depth = match (literal, descends) {
            (true, _) | (false, true) => None,
            (false, false) => Some(remainder - 1),
        };

        let matcher = GlobBuilder::new(&effective)
            .literal_separator(true)
            .build()
            .map_err(|e| FlattenError::Config(format!("Invalid glob pattern '{}': {}", pattern, e)))?
            .compile_matcher();

        Ok(Self {
            pattern: pattern.to_string(),
            base,
            matcher,
            max_depth,
            follow_symlinks: false,
            literal,
        })
    }

    /// Set whether to follow symbolic links
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Matching files in sorted order
    ///
    /// A literal path that does not exist, or a pattern whose directory prefix
    /// does not exist, is a `MissingResource`. A pattern that matches nothing
    /// yields an empty list.
    pub async fn discover(&self) -> Result<Vec<PathBuf>> {
        if self.literal {
            return match fs::metadata(&self.base).await {
                Ok(metadata) if metadata.is_file() => Ok(vec![self.base.clone()]),
                _ => Err(FlattenError::MissingResource {
                    path: self.base.clone(),
                }),
            };
        }

        let walk_root = if self.base.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.base.as_path()
        };
        match fs::metadata(walk_root).await {
            Ok(metadata) if metadata.is_dir() => {}
            _ => {
                return Err(FlattenError::MissingResource {
                    path: walk_root.to_path_buf(),
                });
            }
        }

        let mut files = Vec::new();
        self.discover_files_recursive(&self.base, 0, &mut files).await?;
        files.sort();
        debug!("{} matched {} files", self.pattern, files.len());
        Ok(files)
    }

    /// Recursive helper for discovering files
    fn discover_files_recursive<'a>(
        &'a self,
        dir: &'a Path,
        depth: usize,
        files: &'a mut Vec<PathBuf>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let read_root = if dir.as_os_str().is_empty() {
                Path::new(".")
            } else {
                dir
            };
            let mut read_dir = fs::read_dir(read_root).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                let entry_path = dir.join(entry.file_name());

                let file_type = entry.file_type().await?;
                if file_type.is_symlink() && !self.follow_symlinks {
                    continue;
                }
                let metadata = match fs::metadata(&entry_path).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("Skipping {}: {}", entry_path.display(), e);
                        continue;
                    }
                };

                if metadata.is_file() {
                    if self.should_process(&entry_path) {
                        files.push(entry_path);
                    }
                } else if metadata.is_dir() {
                    if let Some(max_depth) = self.max_depth
                        && depth >= max_depth
                    {
                        continue;
                    }
                    if let Err(e) = self
                        .discover_files_recursive(&entry_path, depth + 1, files)
                        .await
                    {
                        warn!("Error processing {}: {}", entry_path.display(), e);
                    }
                }
            }

            Ok(())
        })
    }

    /// Check if a path matches the pattern
    pub fn should_process(&self, path: &Path) -> bool {
        self.matcher.is_match(path)
    }
}
