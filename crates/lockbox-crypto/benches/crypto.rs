use std::io::Read;

use lockbox_core::CipherMode;
use lockbox_crypto::{copy, generate_iv, Cipher, SymmetricKey, TransferOptions};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn encrypt(key: &SymmetricKey, iv: [u8; 16], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let writer = Cipher::new(CipherMode::Encrypt, key.clone(), iv)
        .encrypt_writer(&mut out)
        .unwrap();
    copy(data, writer, Some(data.len() as u64), &TransferOptions::default(), |_| {}).unwrap();
    out
}

#[divan::bench(args = [4096, 65536, 1048576])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let key = SymmetricKey::generate();
    let iv = generate_iv();
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&key), iv, divan::black_box(&data)));
}

#[divan::bench(args = [4096, 65536, 1048576])]
fn bench_decrypt_stream(bencher: divan::Bencher, size: usize) {
    let key = SymmetricKey::generate();
    let iv = generate_iv();
    let encrypted = encrypt(&key, iv, &make_data(size));
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut reader = Cipher::new(CipherMode::Decrypt, key.clone(), iv)
                .decrypt_reader(divan::black_box(&encrypted[..]))
                .unwrap();
            let mut out = Vec::with_capacity(size);
            reader.read_to_end(&mut out).unwrap();
            out
        });
}

fn main() {
    divan::main();
}
