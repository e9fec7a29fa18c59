// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use tomkv::{create_empty_tom, Storage};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

fn seeded_storage(dir: &TempDir, num_mounts: usize) -> Storage<u64, u64> {
    let storage: Storage<u64, u64> = Storage::new();

    for i in 0..num_mounts {
        let name = dir
            .path()
            .join(format!("tom{}.xml", i))
            .to_string_lossy()
            .into_owned();

        create_empty_tom(&name).unwrap();
        storage.mount("mnt", &name, "a/c");
    }

    assert!(storage.insert("mnt/d", (4, 400)).unwrap());

    storage
}

fn bench_mounted_read(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let storage = seeded_storage(&dir, 1);

    c.bench_function("tomkv: mounted read", |b| {
        b.iter(|| storage.value(black_box("mnt/d")).unwrap())
    });
}

fn bench_fanned_out_read(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let storage = seeded_storage(&dir, 4);

    c.bench_function("tomkv: mounted read, four bindings", |b| {
        b.iter(|| storage.value(black_box("mnt/d")).unwrap())
    });
}

fn bench_mounted_set(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let storage = seeded_storage(&dir, 1);

    c.bench_function("tomkv: mounted set_value", |b| {
        b.iter(|| storage.set_value(black_box("mnt/d"), (22, 2200)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_mounted_read,
    bench_fanned_out_read,
    bench_mounted_set
);
criterion_main!(benches);
