//! Synthetic corpora shared by the service tests.

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::services::store::{MemoryStore, ObjectStore, StoreError};

pub const BUCKET: &str = "photos";

/// Green, bright, landscape and banded: classifies as Nature/Forest.
pub fn textured_green(width: u32, height: u32, invert_ripple: bool) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
        let row = (y * 100 / (height - 1)) as i32;
        let even_band = (x * 9 / width) % 2 == 0;
        let ripple = if even_band != invert_ripple { 8 } else { -8 };
        let s = row + ripple;
        Rgb([(40 + s) as u8, (120 + s) as u8, (20 + s) as u8])
    }))
}

pub fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb(color)))
}

pub fn grey_ramp(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, _| {
        let v = (x * 255 / (width - 1)) as u8;
        Rgb([v, v, v])
    }))
}

pub fn png_bytes(img: &DynamicImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

pub fn reference_png() -> Vec<u8> {
    png_bytes(&textured_green(180, 90, false))
}

/// Ten direct images under `src/`: 3 exact copies of the reference, 1 pixel
/// match (inverted ripple) and 6 unrelated images. Plus a nested image and
/// two non-images that must never be scanned.
pub fn seed_corpus(store: &dyn ObjectStore) {
    let reference = textured_green(180, 90, false);
    let inverted = textured_green(180, 90, true);

    let corpus: Vec<(&str, DynamicImage)> = vec![
        ("src/copy_a.png", reference.clone()),
        ("src/copy_b.png", reference.clone()),
        ("src/copy_c.png", reference),
        ("src/ripple.png", inverted),
        ("src/black.png", solid(120, 80, [0, 0, 0])),
        ("src/red.png", solid(120, 80, [100, 0, 0])),
        ("src/navy.png", solid(120, 80, [0, 0, 80])),
        ("src/brown.png", solid(120, 80, [60, 40, 20])),
        ("src/ramp.png", grey_ramp(120, 80)),
        ("src/charcoal.png", solid(120, 80, [20, 20, 20])),
    ];
    for (key, img) in corpus {
        store.put(BUCKET, key, &png_bytes(&img), "image/png").unwrap();
    }

    store
        .put(BUCKET, "src/archive/old.png", &reference_png(), "image/png")
        .unwrap();
    store.put(BUCKET, "src/notes.txt", b"not an image", "text/plain").unwrap();
    store.put(BUCKET, "src/.DS_Store", b"\0\0", "application/octet-stream").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Get,
    Put,
    Delete,
    Exists,
}

/// Wraps a `MemoryStore` and fails one kind of call for keys containing `needle`.
/// `corrupt_puts` stores truncated bytes instead of failing. `exists_delay`
/// slows every `exists` call; `peak_exists_calls` records how many overlapped.
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_on: Option<(FailOn, &'static str)>,
    pub corrupt_puts: bool,
    pub exists_delay: Option<Duration>,
    pub puts: AtomicUsize,
    pub peak_exists_calls: AtomicUsize,
    pub exists_in_flight: AtomicUsize,
}

impl FaultyStore {
    pub fn new(fail_on: Option<(FailOn, &'static str)>) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_on,
            corrupt_puts: false,
            exists_delay: None,
            puts: AtomicUsize::new(0),
            peak_exists_calls: AtomicUsize::new(0),
            exists_in_flight: AtomicUsize::new(0),
        }
    }

    fn check(&self, op: FailOn, key: &str) -> Result<(), StoreError> {
        match self.fail_on {
            Some((fail, needle)) if fail == op && key.contains(needle) => {
                Err(StoreError::Transient(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }
}

impl ObjectStore for FaultyStore {
    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(bucket, prefix)
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check(FailOn::Get, key)?;
        self.inner.get(bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8], ct: &str) -> Result<(), StoreError> {
        self.check(FailOn::Put, key)?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.corrupt_puts {
            return self.inner.put(bucket, key, &bytes[..bytes.len() / 2], ct);
        }
        self.inner.put(bucket, key, bytes, ct)
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.check(FailOn::Delete, key)?;
        self.inner.delete(bucket, key)
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        self.check(FailOn::Exists, key)?;
        if let Some(delay) = self.exists_delay {
            let now = self.exists_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_exists_calls.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(delay);
            self.exists_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.exists(bucket, key)
    }

    fn presign(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String, StoreError> {
        self.inner.presign(bucket, key, ttl)
    }
}
