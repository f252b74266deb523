#![doc = r#"
# snet-cipher

## 设计动机（Why）
- 隧道帧需要一层廉价的混淆而不是强加密：两端共享一个预置密钥，数据在
  传输前按字节流经过 Blowfish/CFB64 转换。密钥长度可变（1-56 字节），
  与原始实现里 `BF_set_key` 接受的范围一致。
- CFB64（即分组大小等于 Blowfish 块长 64 位的 CFB 模式）天然是一个
  "running" 的流密码：内部状态（上一块密文/位移量）会跨越多次调用持续
  演进，因此加密端和解密端必须使用完全对称的调用顺序，一次调用处理
  不完整的块也不会打乱后续调用。

## 核心契约（What）
- [`Encryptor`]/[`Decryptor`] 都以相同的 `(key, iv)` 构造，随后的
  `apply` 调用次序必须与对端的加密/解密调用次序一一对应；
- [`IVec::random`] 用于连接建立时协商一次性向量，协商后通过
  [`Encryptor::rekey`]/[`Decryptor::rekey`] 重置内部状态而不改变密钥。

## 实现策略（How）
- 基于 RustCrypto 的 `blowfish` + `cfb-mode` + `cipher` crate 组合，
  而不是手写 Feistel 网络或移植 OpenSSL 绑定。
"#]

use cipher::{KeyIvInit, StreamCipher};

type BlowfishCfbEncryptor = cfb_mode::Encryptor<blowfish::Blowfish>;
type BlowfishCfbDecryptor = cfb_mode::Decryptor<blowfish::Blowfish>;

/// 8 字节初始向量，镜像 `BF_cfb64_encrypt` 的 `ivec` 参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IVec([u8; 8]);

impl IVec {
    pub const ZERO: IVec = IVec([0u8; 8]);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        IVec(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// 用随机数据填充向量，供两端协商一次性向量时使用。
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        IVec(bytes)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("key length {0} is outside the supported 1-56 byte range")]
    InvalidKeyLength(usize),
}

impl CipherError {
    pub fn category(&self) -> snet_core::ErrorCategory {
        snet_core::ErrorCategory::ConfigFailure
    }
}

/// 单方向加密器；内部状态随每次 [`Self::apply`] 调用演进。
pub struct Encryptor {
    key: Vec<u8>,
    state: BlowfishCfbEncryptor,
}

impl Encryptor {
    pub fn new(key: &[u8], ivec: &IVec) -> Result<Self, CipherError> {
        let state = build_encryptor(key, ivec)?;
        Ok(Self {
            key: key.to_vec(),
            state,
        })
    }

    /// 用同一个密钥、新的初始向量重置流状态，对应原实现的 `SetIVec`。
    pub fn rekey(&mut self, ivec: &IVec) -> Result<(), CipherError> {
        self.state = build_encryptor(&self.key, ivec)?;
        Ok(())
    }

    /// 原地加密 `data`；可以跨多次调用处理同一条逻辑流。
    pub fn apply(&mut self, data: &mut [u8]) {
        self.state.apply_keystream(data);
    }

    /// 分配一个新缓冲区返回密文，保留输入不变（对应原实现按值返回新
    /// `Buffer` 而不是原地改写的用法场景）。
    pub fn encrypt_to_vec(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

/// 单方向解密器，构造/重置方式与 [`Encryptor`] 对称。
pub struct Decryptor {
    key: Vec<u8>,
    state: BlowfishCfbDecryptor,
}

impl Decryptor {
    pub fn new(key: &[u8], ivec: &IVec) -> Result<Self, CipherError> {
        let state = build_decryptor(key, ivec)?;
        Ok(Self {
            key: key.to_vec(),
            state,
        })
    }

    pub fn rekey(&mut self, ivec: &IVec) -> Result<(), CipherError> {
        self.state = build_decryptor(&self.key, ivec)?;
        Ok(())
    }

    pub fn apply(&mut self, data: &mut [u8]) {
        self.state.apply_keystream(data);
    }

    pub fn decrypt_to_vec(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        out
    }
}

fn build_encryptor(key: &[u8], ivec: &IVec) -> Result<BlowfishCfbEncryptor, CipherError> {
    validate_key_len(key)?;
    BlowfishCfbEncryptor::new_from_slices(key, ivec.as_bytes())
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

fn build_decryptor(key: &[u8], ivec: &IVec) -> Result<BlowfishCfbDecryptor, CipherError> {
    validate_key_len(key)?;
    BlowfishCfbDecryptor::new_from_slices(key, ivec.as_bytes())
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

fn validate_key_len(key: &[u8]) -> Result<(), CipherError> {
    if key.is_empty() || key.len() > 56 {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_call() {
        let key = b"hunter2-shared-secret";
        let ivec = IVec::ZERO;
        let mut enc = Encryptor::new(key, &ivec).unwrap();
        let mut dec = Decryptor::new(key, &ivec).unwrap();

        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let ciphertext = enc.encrypt_to_vec(plaintext);
        assert_ne!(ciphertext, plaintext);

        let decrypted = dec.decrypt_to_vec(&ciphertext);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn round_trips_across_many_small_calls() {
        let key = b"another-shared-secret";
        let ivec = IVec::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut enc = Encryptor::new(key, &ivec).unwrap();
        let mut dec = Decryptor::new(key, &ivec).unwrap();

        let chunks: &[&[u8]] = &[b"a", b"bc", b"defg", b"", b"hijklmno"];
        for chunk in chunks {
            let mut buf = chunk.to_vec();
            enc.apply(&mut buf);
            dec.apply(&mut buf);
            assert_eq!(buf, *chunk);
        }
    }

    #[test]
    fn rekey_resets_stream_state_without_changing_key() {
        let key = b"shared-secret";
        let mut enc = Encryptor::new(key, &IVec::ZERO).unwrap();
        let mut dec = Decryptor::new(key, &IVec::ZERO).unwrap();

        let first = enc.encrypt_to_vec(b"first message");
        assert_eq!(dec.decrypt_to_vec(&first), b"first message");

        let fresh_ivec = IVec::from_bytes([9; 8]);
        enc.rekey(&fresh_ivec).unwrap();
        dec.rekey(&fresh_ivec).unwrap();

        let second = enc.encrypt_to_vec(b"second message");
        assert_eq!(dec.decrypt_to_vec(&second), b"second message");
    }

    #[test]
    fn rejects_oversized_keys() {
        let key = vec![0u8; 57];
        assert!(Encryptor::new(&key, &IVec::ZERO).is_err());
    }

    #[test]
    fn rejects_empty_keys() {
        assert!(Encryptor::new(&[], &IVec::ZERO).is_err());
    }
}
