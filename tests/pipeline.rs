//! Grid pipeline behaviour through a full session on the thread executor.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};
use termview::config::Config;
use termview::executor::Executor;
use termview::pipeline::Session;
use termview::render::Canvas;

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_png(path: &Path, shade: u8) {
    let img = image::RgbImage::from_pixel(6, 6, image::Rgb([shade, 90, 30]));
    img.save_with_format(path, image::ImageFormat::Png).unwrap();
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn session(thumbnail: bool, thumbnail_cache: usize) -> Session {
    let config = Config {
        thumbnail,
        thumbnail_cache,
        multi: false,
        grid_renderers: 2,
        ..Config::default()
    };
    let session = Session::with_executor(config, Executor::threads()).unwrap();
    session.context().grid_active.set();
    session
}

fn images(count: u8) -> (TempDir, Vec<PathBuf>) {
    let dir = tempdir().unwrap();
    let paths = (0..count)
        .map(|i| {
            let path = dir.path().join(format!("{:02}.png", i));
            write_png(&path, i.wrapping_mul(23));
            path
        })
        .collect();
    (dir, paths)
}

fn thumbnail_files(session: &Session) -> usize {
    fs::read_dir(session.thumbnail_dir().unwrap()).unwrap().count()
}

fn wait_in_sync(session: &Session) {
    let ctx = session.context();
    assert!(ctx.resync.renderer().wait_in_sync(TIMEOUT));
    if let Some(thumbnailer) = ctx.resync.thumbnailer() {
        assert!(thumbnailer.wait_in_sync(TIMEOUT));
    }
}

#[test]
fn test_cells_render_with_and_without_thumbnails() {
    for thumbnail in [false, true] {
        let (_dir, paths) = images(3);
        let session = session(thumbnail, 0);
        for path in &paths {
            session.request_grid_cell(path);
        }
        assert!(wait_for(|| paths.iter().all(|p| session.grid_cell(p).is_some())));
        for path in &paths {
            assert!(matches!(session.grid_cell(path), Some(Canvas::Rendered(_))));
        }
        assert!(wait_for(|| session.context().activity.is_idle()));
    }
}

#[test]
fn test_no_stale_cells_after_resync() {
    let (_dir, paths) = images(12);
    let session = session(true, 0);
    for path in &paths {
        session.request_grid_cell(path);
    }
    session.resync_grid();
    wait_in_sync(&session);

    // Whatever was queued or in flight belonged to the previous batch
    thread::sleep(Duration::from_millis(300));
    assert!(session.context().grid_cache.is_empty());
    assert!(wait_for(|| session.context().activity.is_idle()));
}

#[test]
fn test_repeated_resyncs_complete() {
    let (_dir, paths) = images(8);
    let session = session(true, 4);
    let mut last = None;
    for round in 0..10 {
        for path in paths.iter().skip(round % 3) {
            session.request_grid_cell(path);
        }
        let epoch = session.resync_grid();
        assert!(last.map_or(true, |l| epoch > l));
        last = Some(epoch);
    }
    wait_in_sync(&session);

    // The pipeline still works after the last resync
    session.request_grid_cell(&paths[0]);
    assert!(wait_for(|| session.grid_cell(&paths[0]).is_some()));
    assert!(wait_for(|| session.context().activity.is_idle()));
}

#[test]
fn test_repeated_requests_share_one_cell() {
    let (_dir, paths) = images(1);
    let session = session(true, 0);
    for _ in 0..4 {
        session.request_grid_cell(&paths[0]);
    }
    assert!(wait_for(|| session.grid_cell(&paths[0]).is_some()));
    assert!(wait_for(|| session.context().activity.is_idle()));
    assert_eq!(session.context().grid_cache.len(), 1);
    assert_eq!(thumbnail_files(&session), 1);
}

#[test]
fn test_identical_images_share_one_thumbnail() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("first.png");
    let second = dir.path().join("second.png");
    write_png(&first, 200);
    write_png(&second, 200);

    let session = session(true, 0);
    session.request_grid_cell(&first);
    assert!(wait_for(|| session.grid_cell(&first).is_some()));
    session.request_grid_cell(&second);
    assert!(wait_for(|| session.grid_cell(&second).is_some()));

    // The replaced thumbnail goes once the first cell no longer needs it
    assert!(wait_for(|| thumbnail_files(&session) == 1));
    let cache = session.context().thumbnails.as_ref().unwrap();
    let thumbnail = cache.get(&first).unwrap();
    assert_eq!(cache.get(&second), Some(thumbnail.clone()));
    let mut sources = cache.sources_of(&thumbnail);
    sources.sort();
    assert_eq!(sources, vec![first.clone(), second.clone()]);

    assert_eq!(session.grid_cell(&first), session.grid_cell(&second));
}

#[test]
fn test_thumbnail_cache_stays_bounded() {
    let (_dir, paths) = images(6);
    let session = session(true, 2);
    for path in &paths {
        session.request_grid_cell(path);
    }
    assert!(wait_for(|| paths.iter().all(|p| session.grid_cell(p).is_some())));

    let cache = session.context().thumbnails.as_ref().unwrap();
    assert!(cache.source_count() <= 2);
    assert!(wait_for(|| thumbnail_files(&session) <= 2));
}

#[test]
fn test_session_cleans_up_thumbnails() {
    let (_dir, paths) = images(2);
    let session = session(true, 0);
    for path in &paths {
        session.request_grid_cell(path);
    }
    assert!(wait_for(|| paths.iter().all(|p| session.grid_cell(p).is_some())));
    let thumbnails = session.thumbnail_dir().unwrap().to_path_buf();
    drop(session);
    assert!(!thumbnails.exists());
}
