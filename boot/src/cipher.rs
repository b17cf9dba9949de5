// Licensed under the Apache-2.0 license

//! AES-128-CBC streaming over transfer chunks.
//!
//! One [`CipherStream`] lives for the duration of a single transfer; the CBC
//! state chains across chunks, so the result is independent of how the
//! transfer splits the image.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use mbr::Aes128Params;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub(crate) const AES_BLOCK_LEN: usize = 16;

pub(crate) enum CipherStream {
    Plain,
    Encrypt(Aes128CbcEnc),
    Decrypt(Aes128CbcDec),
}

impl CipherStream {
    pub fn plain() -> Self {
        CipherStream::Plain
    }

    pub fn encrypt(params: &Aes128Params) -> Self {
        CipherStream::Encrypt(Aes128CbcEnc::new(&params.key.into(), &params.iv.into()))
    }

    pub fn decrypt(params: &Aes128Params) -> Self {
        CipherStream::Decrypt(Aes128CbcDec::new(&params.key.into(), &params.iv.into()))
    }

    /// Transform a chunk in place. Chunks handed to the cipher variants must
    /// be a whole number of AES blocks; transfers pad image lengths up front.
    pub fn apply(&mut self, chunk: &mut [u8]) {
        match self {
            CipherStream::Plain => {}
            CipherStream::Encrypt(enc) => {
                for block in chunk.chunks_exact_mut(AES_BLOCK_LEN) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherStream::Decrypt(dec) => {
                for block in chunk.chunks_exact_mut(AES_BLOCK_LEN) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
    }
}
