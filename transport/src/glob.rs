//! Glob matching over the remote filesystem.
//!
//! Patterns are `/`-separated; `*`, `?` and character classes match within
//! one segment, `**` matches zero or more segments. Traversal is depth
//! first over [`RemotePath::iterdir`] and never follows symlinks, so runs
//! are deterministic even on link-cycled trees. Symlinks can still *match*
//! a pattern; they are just not descended into.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use globset::{GlobBuilder, GlobMatcher};

use crate::facade::FileType;
use crate::remote_path::RemotePath;
use crate::{FacadeResult, TransportError};

enum Segment {
    /// `**`
    Recursive,
    Match(GlobMatcher),
}

fn compile(pattern: &str) -> FacadeResult<Vec<Segment>> {
    if pattern.is_empty() || pattern.starts_with('/') {
        return Err(TransportError::Protocol(format!(
            "glob pattern must be relative and non-empty: {pattern:?}"
        )));
    }
    pattern
        .split('/')
        .map(|segment| {
            if segment.is_empty() {
                return Err(TransportError::Protocol(format!(
                    "glob pattern has an empty segment: {pattern:?}"
                )));
            }
            if segment == "**" {
                return Ok(Segment::Recursive);
            }
            let matcher = GlobBuilder::new(segment)
                .literal_separator(true)
                .build()
                .map_err(|err| {
                    TransportError::Protocol(format!("bad glob pattern {pattern:?}: {err}"))
                })?
                .compile_matcher();
            Ok(Segment::Match(matcher))
        })
        .collect()
}

/// All paths under `root` matching `pattern`, depth first.
pub async fn glob(root: &RemotePath, pattern: &str) -> FacadeResult<Vec<RemotePath>> {
    let segments = compile(pattern)?;
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    walk(root, &segments, 0, &mut out, &mut seen).await?;
    Ok(out)
}

fn walk<'a>(
    node: &'a RemotePath,
    segments: &'a [Segment],
    idx: usize,
    out: &'a mut Vec<RemotePath>,
    seen: &'a mut HashSet<String>,
) -> Pin<Box<dyn Future<Output = FacadeResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let last = idx + 1 == segments.len();
        match &segments[idx] {
            Segment::Recursive => {
                for child in node.iterdir().await? {
                    if last && seen.insert(child.path().to_string()) {
                        out.push(child.clone());
                    }
                    if child.known_type() == Some(FileType::Directory) {
                        walk(&child, segments, idx, out, seen).await?;
                    }
                }
                if !last {
                    // `**` spanning zero segments
                    walk(node, segments, idx + 1, out, seen).await?;
                }
            }
            Segment::Match(matcher) => {
                for child in node.iterdir().await? {
                    if !matcher.is_match(child.name()) {
                        continue;
                    }
                    if last {
                        if seen.insert(child.path().to_string()) {
                            out.push(child);
                        }
                    } else if child.known_type() == Some(FileType::Directory) {
                        walk(&child, segments, idx + 1, out, seen).await?;
                    }
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::FacadeClient;
    use crate::mock::MockFacade;
    use std::sync::Arc;

    async fn matched(root: &RemotePath, pattern: &str) -> Vec<String> {
        let mut paths: Vec<_> = glob(root, pattern)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.path().to_string())
            .collect();
        paths.sort();
        paths
    }

    fn tree() -> RemotePath {
        let mock = MockFacade::shared();
        mock.put_file("/work/job.sh", b"#!/bin/bash");
        mock.put_file("/work/a.txt", b"a");
        mock.put_file("/work/b.dat", b"b");
        mock.put_dir("/work/out/deep");
        mock.put_file("/work/out/c.txt", b"c");
        mock.put_file("/work/out/deep/d.txt", b"d");
        mock.put_symlink("/work/link", "/work/out");
        let facade: Arc<dyn FacadeClient> = mock;
        RemotePath::with_metadata(facade, "machine", "/work", '/', FileType::Directory, 0)
    }

    #[tokio::test]
    async fn double_star_matches_every_descendant() {
        let root = tree();
        assert_eq!(
            matched(&root, "**").await,
            vec![
                "/work/a.txt",
                "/work/b.dat",
                "/work/job.sh",
                "/work/link",
                "/work/out",
                "/work/out/c.txt",
                "/work/out/deep",
                "/work/out/deep/d.txt",
            ]
        );
    }

    #[tokio::test]
    async fn star_matches_one_segment() {
        let root = tree();
        assert_eq!(matched(&root, "*.txt").await, vec!["/work/a.txt"]);
    }

    #[tokio::test]
    async fn double_star_spans_zero_segments() {
        let root = tree();
        assert_eq!(
            matched(&root, "**/*.txt").await,
            vec![
                "/work/a.txt",
                "/work/out/c.txt",
                "/work/out/deep/d.txt",
            ]
        );
    }

    #[tokio::test]
    async fn prefixed_recursion_stays_under_the_prefix() {
        let root = tree();
        assert_eq!(
            matched(&root, "out/**").await,
            vec![
                "/work/out/c.txt",
                "/work/out/deep",
                "/work/out/deep/d.txt",
            ]
        );
    }

    #[tokio::test]
    async fn question_mark_and_classes_match_within_a_segment() {
        let root = tree();
        assert_eq!(matched(&root, "?.txt").await, vec!["/work/a.txt"]);
        assert_eq!(matched(&root, "[ab].*").await, vec!["/work/a.txt", "/work/b.dat"]);
    }

    #[tokio::test]
    async fn symlinks_are_not_descended_into() {
        let root = tree();
        // link itself can match, nothing under it does
        let paths = matched(&root, "link/**").await;
        assert!(paths.is_empty(), "{paths:?}");
        assert_eq!(matched(&root, "link").await, vec!["/work/link"]);
    }

    #[tokio::test]
    async fn absolute_patterns_are_rejected() {
        let root = tree();
        assert!(glob(&root, "/etc/**").await.is_err());
        assert!(glob(&root, "").await.is_err());
    }
}
