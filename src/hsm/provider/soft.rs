//! The built-in software token.
//!
//! This provider keeps its tokens and their keys in process memory and does
//! the cryptography with OpenSSL. It behaves like a PKCS#11 library as far
//! as this crate relies on: tokens are addressed by label, private objects
//! need a logged in session, login state is shared by all sessions on a
//! token and ends when the last session closes, and session objects go away
//! with their session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use openssl::bn::{BigNum, BigNumContext};
use openssl::dsa::{Dsa, DsaSig};
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::{MessageDigest, hash};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::{Padding, Rsa};
use openssl::sign::Signer;
use rand::RngCore;

use crate::error::{DeviceError, Rv};

use super::{
    Attribute, AttributeType, KeyType, Mechanism, ObjectClass, ObjectHandle, SessionHandle, SessionInfo, SlotId,
    find_attribute, find_bytes, oid, pad_label,
};

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);


//------------ BuiltinProvider -----------------------------------------------

pub struct BuiltinProvider {
    id: u64,
    state: Mutex<SoftState>,
}

impl BuiltinProvider {
    pub fn new() -> Self {
        BuiltinProvider {
            id: NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SoftState::default()),
        }
    }

    /// Adds a token and returns self, for chaining during setup.
    pub fn with_token(self, label: &str, pin: &str) -> Self {
        self.add_token(label, pin);
        self
    }

    /// Adds a token with the given label and user PIN.
    ///
    /// Labels longer than a PKCS#11 token label field are cut short.
    pub fn add_token(&self, label: &str, pin: &str) -> SlotId {
        let mut state = self.state();
        state.tokens.push(SoftToken {
            label: pad_label(label),
            pin: pin.to_string(),
            present: true,
            logged_in: false,
            objects: BTreeMap::new(),
        });
        (state.tokens.len() - 1) as SlotId
    }

    /// Inserts or removes the token with the given label.
    ///
    /// Removing a token closes all its sessions. Returns whether a token with
    /// that label exists.
    pub fn set_token_present(&self, label: &str, present: bool) -> bool {
        let padded = pad_label(label);
        let mut state = self.state();
        let Some(slot) = state.tokens.iter().position(|t| t.label == padded) else {
            return false;
        };
        state.tokens[slot].present = present;
        if !present {
            state.tokens[slot].logged_in = false;
            let closed: Vec<u64> = state
                .sessions
                .iter()
                .filter(|(_, s)| **s == slot)
                .map(|(h, _)| *h)
                .collect();
            for handle in closed {
                state.remove_session(handle);
            }
        }
        true
    }

    /// Makes the next call of a provider function fail.
    #[cfg(test)]
    pub fn fail_next(&self, function: &'static str) {
        self.state().fail_next.push(function);
    }

    /// A number unique to this provider within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        format!("builtin#{}", self.id)
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap()
    }
}

impl Default for BuiltinProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BuiltinProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BuiltinProvider").field("id", &self.id).finish()
    }
}

/// # Provider calls
impl BuiltinProvider {
    pub fn initialize(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.initialized {
            return Err(DeviceError::new("C_Initialize", Rv::CRYPTOKI_ALREADY_INITIALIZED));
        }
        state.initialized = true;
        Ok(())
    }

    pub fn finalize(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.check_initialized("C_Finalize")?;
        let handles: Vec<u64> = state.sessions.keys().copied().collect();
        for handle in handles {
            state.remove_session(handle);
        }
        for token in state.tokens.iter_mut() {
            token.logged_in = false;
        }
        state.initialized = false;
        Ok(())
    }

    pub fn slots_with_token(&self) -> Result<Vec<SlotId>, DeviceError> {
        let state = self.state();
        state.check_initialized("C_GetSlotList")?;
        Ok(state
            .tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.present)
            .map(|(slot, _)| slot as SlotId)
            .collect())
    }

    pub fn token_label(&self, slot: SlotId) -> Result<Vec<u8>, DeviceError> {
        let state = self.state();
        state.check_initialized("C_GetTokenInfo")?;
        let token = state.token("C_GetTokenInfo", slot)?;
        Ok(token.label.clone())
    }

    pub fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError> {
        let mut state = self.state();
        state.check_initialized("C_OpenSession")?;
        state.token("C_OpenSession", slot)?;
        let handle = state.next_handle();
        state.sessions.insert(handle, slot as usize);
        Ok(SessionHandle::new(handle))
    }

    pub fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.check_initialized("C_CloseSession")?;
        state.slot_of("C_CloseSession", session)?;
        state.remove_session(session.value());
        Ok(())
    }

    pub fn session_info(&self, session: SessionHandle) -> Result<SessionInfo, DeviceError> {
        let state = self.state();
        state.check_initialized("C_GetSessionInfo")?;
        let slot = state.slot_of("C_GetSessionInfo", session)?;
        Ok(SessionInfo { slot: slot as SlotId })
    }

    pub fn login(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.check_initialized("C_Login")?;
        let slot = state.slot_of("C_Login", session)?;
        let token = &mut state.tokens[slot];
        if token.logged_in {
            return Err(DeviceError::new("C_Login", Rv::USER_ALREADY_LOGGED_IN));
        }
        if token.pin != pin {
            return Err(DeviceError::new("C_Login", Rv::PIN_INCORRECT));
        }
        token.logged_in = true;
        Ok(())
    }

    pub fn logout(&self, session: SessionHandle) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.check_initialized("C_Logout")?;
        let slot = state.slot_of("C_Logout", session)?;
        let token = &mut state.tokens[slot];
        if !token.logged_in {
            return Err(DeviceError::new("C_Logout", Rv::USER_NOT_LOGGED_IN));
        }
        token.logged_in = false;
        Ok(())
    }

    pub fn find_objects(&self, session: SessionHandle, template: &[Attribute]) -> Result<Vec<ObjectHandle>, DeviceError> {
        let state = self.state();
        state.check_initialized("C_FindObjects")?;
        let slot = state.slot_of("C_FindObjects", session)?;
        let token = &state.tokens[slot];
        Ok(token
            .objects
            .iter()
            .filter(|(_, obj)| token.logged_in || !obj.is_private())
            .filter(|(_, obj)| template.iter().all(|attr| obj.attrs.contains(attr)))
            .map(|(handle, _)| ObjectHandle::new(*handle))
            .collect())
    }

    pub fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>, DeviceError> {
        let state = self.state();
        state.check_initialized("C_GetAttributeValue")?;
        let obj = state.object("C_GetAttributeValue", session, object)?;
        Ok(types
            .iter()
            .filter_map(|t| find_attribute(&obj.attrs, *t).cloned())
            .collect())
    }

    pub fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        const FUNCTION: &str = "C_GenerateKeyPair";
        {
            let state = self.state();
            state.check_initialized(FUNCTION)?;
            state.check_logged_in(FUNCTION, session)?;
        }

        // Key generation can take a while, so do it without holding the lock.
        let generated = match mechanism {
            Mechanism::RsaPkcsKeyPairGen => generate_rsa(public_template),
            Mechanism::DsaKeyPairGen => generate_dsa(public_template),
            Mechanism::EcKeyPairGen => generate_ec(public_template),
            Mechanism::EcEdwardsKeyPairGen => generate_eddsa(public_template),
            _ => return Err(DeviceError::new(FUNCTION, Rv::MECHANISM_INVALID)),
        }
        .map_err(|rv| DeviceError::new(FUNCTION, rv))?;

        let mut public_attrs = vec![Attribute::Class(ObjectClass::PublicKey)];
        public_attrs.extend(generated.public);
        let public_attrs = merge_template(public_attrs, public_template, &[Attribute::Private(false)]);

        let mut private_attrs = vec![Attribute::Class(ObjectClass::PrivateKey)];
        private_attrs.extend(generated.private);
        let private_attrs = merge_template(
            private_attrs,
            private_template,
            &[Attribute::Private(true), Attribute::Sensitive(true)],
        );

        let mut state = self.state();
        // The session may have gone away while we were generating.
        let slot = state.check_logged_in(FUNCTION, session)?;
        let public = state.insert_object(slot, session, public_attrs, None);
        let private = state.insert_object(slot, session, private_attrs, Some(generated.key));
        Ok((public, private))
    }

    pub fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        template: &[Attribute],
    ) -> Result<ObjectHandle, DeviceError> {
        const FUNCTION: &str = "C_GenerateKey";
        let slot = {
            let state = self.state();
            state.check_initialized(FUNCTION)?;
            state.slot_of(FUNCTION, session)?
        };
        let attrs = match mechanism {
            Mechanism::DsaParameterGen => generate_dsa_parameters(template),
            _ => return Err(DeviceError::new(FUNCTION, Rv::MECHANISM_INVALID)),
        }
        .map_err(|rv| DeviceError::new(FUNCTION, rv))?;

        let attrs = merge_template(attrs, template, &[Attribute::Private(false)]);
        let mut state = self.state();
        state.slot_of(FUNCTION, session)?;
        Ok(state.insert_object(slot, session, attrs, None))
    }

    pub fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.check_initialized("C_DestroyObject")?;
        state.object("C_DestroyObject", session, object)?;
        state.check_failure("C_DestroyObject")?;
        let slot = state.slot_of("C_DestroyObject", session)?;
        state.tokens[slot].objects.remove(&object.value());
        Ok(())
    }

    pub fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        const FUNCTION: &str = "C_Sign";
        let pkey = {
            let state = self.state();
            state.check_initialized(FUNCTION)?;
            let obj = state.object(FUNCTION, session, key)?;
            if obj.attrs.contains(&Attribute::Sign(false)) {
                return Err(DeviceError::new(FUNCTION, Rv::KEY_TYPE_INCONSISTENT));
            }
            obj.key
                .clone()
                .ok_or_else(|| DeviceError::new(FUNCTION, Rv::KEY_HANDLE_INVALID))?
        };

        let res = match (mechanism, pkey.id()) {
            (Mechanism::RsaPkcs, Id::RSA) => sign_rsa_pkcs(&pkey, data),
            (Mechanism::Dsa, Id::DSA) => sign_dsa(&pkey, data),
            (Mechanism::Ecdsa, Id::EC) => sign_ecdsa(&pkey, data),
            (Mechanism::Eddsa, Id::ED25519) | (Mechanism::Eddsa, Id::ED448) => sign_eddsa(&pkey, data),
            (Mechanism::RsaPkcs, _) | (Mechanism::Dsa, _) | (Mechanism::Ecdsa, _) | (Mechanism::Eddsa, _) => {
                return Err(DeviceError::new(FUNCTION, Rv::KEY_TYPE_INCONSISTENT));
            }
            _ => return Err(DeviceError::new(FUNCTION, Rv::MECHANISM_INVALID)),
        };
        res.map_err(|err| DeviceError::with_detail(FUNCTION, Rv::FUNCTION_FAILED, err.to_string()))
    }

    pub fn digest(&self, session: SessionHandle, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        const FUNCTION: &str = "C_Digest";
        {
            let state = self.state();
            state.check_initialized(FUNCTION)?;
            state.slot_of(FUNCTION, session)?;
        }
        let md = match mechanism {
            Mechanism::Md5 => MessageDigest::md5(),
            Mechanism::Sha1 => MessageDigest::sha1(),
            Mechanism::Sha256 => MessageDigest::sha256(),
            Mechanism::Sha384 => MessageDigest::sha384(),
            Mechanism::Sha512 => MessageDigest::sha512(),
            _ => return Err(DeviceError::new(FUNCTION, Rv::MECHANISM_INVALID)),
        };
        hash(md, data)
            .map(|digest| digest.to_vec())
            .map_err(|err| DeviceError::with_detail(FUNCTION, Rv::FUNCTION_FAILED, err.to_string()))
    }

    pub fn generate_random(&self, session: SessionHandle, len: usize) -> Result<Vec<u8>, DeviceError> {
        {
            let state = self.state();
            state.check_initialized("C_GenerateRandom")?;
            state.slot_of("C_GenerateRandom", session)?;
        }
        let mut buf = vec![0u8; len];
        rand::rng().fill_bytes(&mut buf);
        Ok(buf)
    }
}


//------------ SoftState -----------------------------------------------------

#[derive(Default)]
struct SoftState {
    initialized: bool,
    tokens: Vec<SoftToken>,

    /// Maps open sessions to the slot they were opened on.
    sessions: HashMap<u64, usize>,

    /// Sessions and objects share one handle space.
    last_handle: u64,

    /// Functions whose next call fails with a device error.
    #[cfg(test)]
    fail_next: Vec<&'static str>,
}

impl SoftState {
    #[cfg(test)]
    fn check_failure(&mut self, function: &'static str) -> Result<(), DeviceError> {
        match self.fail_next.iter().position(|f| *f == function) {
            Some(pos) => {
                self.fail_next.remove(pos);
                Err(DeviceError::new(function, Rv::DEVICE_ERROR))
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn check_failure(&mut self, _function: &'static str) -> Result<(), DeviceError> {
        Ok(())
    }

    fn next_handle(&mut self) -> u64 {
        self.last_handle += 1;
        self.last_handle
    }

    fn check_initialized(&self, function: &'static str) -> Result<(), DeviceError> {
        if self.initialized {
            Ok(())
        } else {
            Err(DeviceError::new(function, Rv::CRYPTOKI_NOT_INITIALIZED))
        }
    }

    fn token(&self, function: &'static str, slot: SlotId) -> Result<&SoftToken, DeviceError> {
        let token = usize::try_from(slot)
            .ok()
            .and_then(|slot| self.tokens.get(slot))
            .ok_or_else(|| DeviceError::new(function, Rv::SLOT_ID_INVALID))?;
        if !token.present {
            return Err(DeviceError::new(function, Rv::TOKEN_NOT_PRESENT));
        }
        Ok(token)
    }

    fn slot_of(&self, function: &'static str, session: SessionHandle) -> Result<usize, DeviceError> {
        self.sessions
            .get(&session.value())
            .copied()
            .ok_or_else(|| DeviceError::new(function, Rv::SESSION_HANDLE_INVALID))
    }

    fn check_logged_in(&self, function: &'static str, session: SessionHandle) -> Result<usize, DeviceError> {
        let slot = self.slot_of(function, session)?;
        if !self.tokens[slot].logged_in {
            return Err(DeviceError::new(function, Rv::USER_NOT_LOGGED_IN));
        }
        Ok(slot)
    }

    fn object(&self, function: &'static str, session: SessionHandle, object: ObjectHandle) -> Result<&SoftObject, DeviceError> {
        let slot = self.slot_of(function, session)?;
        let token = &self.tokens[slot];
        let obj = token
            .objects
            .get(&object.value())
            .ok_or_else(|| DeviceError::new(function, Rv::OBJECT_HANDLE_INVALID))?;
        if obj.is_private() && !token.logged_in {
            return Err(DeviceError::new(function, Rv::USER_NOT_LOGGED_IN));
        }
        Ok(obj)
    }

    fn insert_object(
        &mut self,
        slot: usize,
        session: SessionHandle,
        attrs: Vec<Attribute>,
        key: Option<PKey<Private>>,
    ) -> ObjectHandle {
        let owner = if attrs.contains(&Attribute::Token(true)) {
            None
        } else {
            Some(session.value())
        };
        let handle = self.next_handle();
        self.tokens[slot].objects.insert(handle, SoftObject { attrs, key, owner });
        ObjectHandle::new(handle)
    }

    /// Drops a session together with its session objects.
    fn remove_session(&mut self, handle: u64) {
        let Some(slot) = self.sessions.remove(&handle) else {
            return;
        };
        let token = &mut self.tokens[slot];
        token.objects.retain(|_, obj| obj.owner != Some(handle));
        if !self.sessions.values().any(|s| *s == slot) {
            token.logged_in = false;
        }
    }
}


//------------ SoftToken -----------------------------------------------------

struct SoftToken {
    label: Vec<u8>,
    pin: String,
    present: bool,
    logged_in: bool,
    objects: BTreeMap<u64, SoftObject>,
}


//------------ SoftObject ----------------------------------------------------

struct SoftObject {
    attrs: Vec<Attribute>,

    /// The private key material. Never exposed as an attribute.
    key: Option<PKey<Private>>,

    /// The session owning a session object, `None` for token objects.
    owner: Option<u64>,
}

impl SoftObject {
    fn is_private(&self) -> bool {
        self.attrs.contains(&Attribute::Private(true))
    }
}


//------------ Key generation ------------------------------------------------

struct GeneratedPair {
    key: PKey<Private>,
    public: Vec<Attribute>,
    private: Vec<Attribute>,
}

fn generate_rsa(template: &[Attribute]) -> Result<GeneratedPair, Rv> {
    let bits = match find_attribute(template, AttributeType::ModulusBits) {
        Some(Attribute::ModulusBits(bits)) => u32::try_from(*bits).map_err(|_| Rv::ATTRIBUTE_VALUE_INVALID)?,
        _ => return Err(Rv::TEMPLATE_INCOMPLETE),
    };
    let exponent = find_bytes(template, AttributeType::PublicExponent).unwrap_or(&[0x01, 0x00, 0x01]);
    let exponent = BigNum::from_slice(exponent).map_err(|_| Rv::ATTRIBUTE_VALUE_INVALID)?;
    let rsa = Rsa::generate_with_e(bits, &exponent).map_err(|_| Rv::ATTRIBUTE_VALUE_INVALID)?;

    let modulus = rsa.n().to_vec();
    let exponent = rsa.e().to_vec();
    let key = PKey::from_rsa(rsa).map_err(general)?;
    Ok(GeneratedPair {
        key,
        public: vec![
            Attribute::KeyType(KeyType::Rsa),
            Attribute::Modulus(modulus.clone()),
            Attribute::PublicExponent(exponent.clone()),
            Attribute::ModulusBits(u64::from(bits)),
        ],
        private: vec![
            Attribute::KeyType(KeyType::Rsa),
            Attribute::Modulus(modulus),
            Attribute::PublicExponent(exponent),
        ],
    })
}

fn generate_dsa_parameters(template: &[Attribute]) -> Result<Vec<Attribute>, Rv> {
    let bits = match find_attribute(template, AttributeType::PrimeBits) {
        Some(Attribute::PrimeBits(bits)) => u32::try_from(*bits).map_err(|_| Rv::ATTRIBUTE_VALUE_INVALID)?,
        _ => return Err(Rv::TEMPLATE_INCOMPLETE),
    };
    let dsa = Dsa::generate(bits).map_err(|_| Rv::ATTRIBUTE_VALUE_INVALID)?;
    Ok(vec![
        Attribute::Class(ObjectClass::DomainParameters),
        Attribute::KeyType(KeyType::Dsa),
        Attribute::Prime(dsa.p().to_vec()),
        Attribute::SubPrime(dsa.q().to_vec()),
        Attribute::Base(dsa.g().to_vec()),
        Attribute::PrimeBits(u64::from(bits)),
    ])
}

fn generate_dsa(template: &[Attribute]) -> Result<GeneratedPair, Rv> {
    let component = |t| {
        find_bytes(template, t)
            .ok_or(Rv::TEMPLATE_INCOMPLETE)
            .and_then(|v| BigNum::from_slice(v).map_err(general))
    };
    let prime = component(AttributeType::Prime)?;
    let subprime = component(AttributeType::SubPrime)?;
    let base = component(AttributeType::Base)?;
    let (p, q, g) = (prime.to_vec(), subprime.to_vec(), base.to_vec());

    let dsa = Dsa::from_pqg(prime, subprime, base)
        .and_then(|params| params.generate_key())
        .map_err(|_| Rv::TEMPLATE_INCONSISTENT)?;
    let value = dsa.pub_key().to_vec();
    let key = PKey::from_dsa(dsa).map_err(general)?;
    Ok(GeneratedPair {
        key,
        public: vec![
            Attribute::KeyType(KeyType::Dsa),
            Attribute::Prime(p.clone()),
            Attribute::SubPrime(q.clone()),
            Attribute::Base(g.clone()),
            Attribute::Value(value),
        ],
        private: vec![
            Attribute::KeyType(KeyType::Dsa),
            Attribute::Prime(p),
            Attribute::SubPrime(q),
            Attribute::Base(g),
        ],
    })
}

fn generate_ec(template: &[Attribute]) -> Result<GeneratedPair, Rv> {
    let params = find_bytes(template, AttributeType::EcParams).ok_or(Rv::TEMPLATE_INCOMPLETE)?;
    let nid = match params {
        oid::P256 => Nid::X9_62_PRIME256V1,
        oid::P384 => Nid::SECP384R1,
        _ => return Err(Rv::CURVE_NOT_SUPPORTED),
    };
    let group = EcGroup::from_curve_name(nid).map_err(general)?;
    let ec = EcKey::generate(&group).map_err(general)?;
    let mut ctx = BigNumContext::new().map_err(general)?;
    let point = ec
        .public_key()
        .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
        .map_err(general)?;
    let key = PKey::from_ec_key(ec).map_err(general)?;

    // The EC point is on the private object as well, so the public key can
    // be recovered when the public object was not kept.
    let attrs = vec![
        Attribute::KeyType(KeyType::Ec),
        Attribute::EcParams(params.to_vec()),
        Attribute::EcPoint(der_octet_string(&point)),
    ];
    Ok(GeneratedPair {
        key,
        public: attrs.clone(),
        private: attrs,
    })
}

fn generate_eddsa(template: &[Attribute]) -> Result<GeneratedPair, Rv> {
    let params = find_bytes(template, AttributeType::EcParams).ok_or(Rv::TEMPLATE_INCOMPLETE)?;
    let key = match params {
        oid::ED25519 => PKey::generate_ed25519(),
        oid::ED448 => PKey::generate_ed448(),
        _ => return Err(Rv::CURVE_NOT_SUPPORTED),
    }
    .map_err(general)?;
    let point = key.raw_public_key().map_err(general)?;

    let attrs = vec![
        Attribute::KeyType(KeyType::EcEdwards),
        Attribute::EcParams(params.to_vec()),
        Attribute::EcPoint(der_octet_string(&point)),
    ];
    Ok(GeneratedPair {
        key,
        public: attrs.clone(),
        private: attrs,
    })
}


//------------ Signing -------------------------------------------------------

fn sign_rsa_pkcs(pkey: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let rsa = pkey.rsa()?;
    let mut buf = vec![0u8; rsa.size() as usize];
    let len = rsa.private_encrypt(data, &mut buf, Padding::PKCS1)?;
    buf.truncate(len);
    Ok(buf)
}

/// Produces a raw `r | s` DSA signature like CKM_DSA does.
fn sign_dsa(pkey: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let q_len = pkey.dsa()?.q().num_bytes() as usize;
    let mut ctx = PkeyCtx::new(pkey)?;
    ctx.sign_init()?;
    let mut der = Vec::new();
    ctx.sign_to_vec(data, &mut der)?;
    let sig = DsaSig::from_der(&der)?;
    let mut res = sig.r().to_vec_padded(q_len as i32)?;
    res.extend(sig.s().to_vec_padded(q_len as i32)?);
    Ok(res)
}

/// Produces a raw `r | s` ECDSA signature like CKM_ECDSA does.
fn sign_ecdsa(pkey: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let ec = pkey.ec_key()?;
    let field_len = ec.group().degree().div_ceil(8) as i32;
    let sig = EcdsaSig::sign(data, &ec)?;
    let mut res = sig.r().to_vec_padded(field_len)?;
    res.extend(sig.s().to_vec_padded(field_len)?);
    Ok(res)
}

fn sign_eddsa(pkey: &PKey<Private>, data: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let mut signer = Signer::new_without_digest(pkey)?;
    signer.sign_oneshot_to_vec(data)
}


//------------ Helpers -------------------------------------------------------

fn general(_: ErrorStack) -> Rv {
    Rv::GENERAL_ERROR
}

/// Adds template attributes the generated object doesn't set itself.
fn merge_template(mut attrs: Vec<Attribute>, template: &[Attribute], defaults: &[Attribute]) -> Vec<Attribute> {
    for attr in template.iter().chain(defaults) {
        if find_attribute(&attrs, attr.attribute_type()).is_none() {
            attrs.push(attr.clone());
        }
    }
    attrs
}

/// Wraps content into a DER OCTET STRING the way CKA_EC_POINT is encoded.
fn der_octet_string(content: &[u8]) -> Vec<u8> {
    let mut res = vec![0x04];
    match content.len() {
        len @ 0..=0x7f => res.push(len as u8),
        len @ 0x80..=0xff => res.extend([0x81, len as u8]),
        len => res.extend([0x82, (len >> 8) as u8, len as u8]),
    }
    res.extend_from_slice(content);
    res
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::constants::TOKEN_LABEL_LENGTH;

    use super::*;

    fn logged_in(provider: &BuiltinProvider) -> SessionHandle {
        provider.initialize().unwrap();
        let session = provider.open_session(0).unwrap();
        provider.login(session, "1234").unwrap();
        session
    }

    fn ec_templates(params: &[u8]) -> (Vec<Attribute>, Vec<Attribute>) {
        let public = vec![
            Attribute::Token(true),
            Attribute::Id(vec![1, 2, 3]),
            Attribute::EcParams(params.to_vec()),
        ];
        let private = vec![Attribute::Token(true), Attribute::Id(vec![1, 2, 3])];
        (public, private)
    }

    #[test]
    fn should_refuse_double_initialization() {
        let provider = BuiltinProvider::new();
        provider.initialize().unwrap();
        let err = provider.initialize().unwrap_err();
        assert!(err.is(Rv::CRYPTOKI_ALREADY_INITIALIZED));
        provider.finalize().unwrap();
        assert!(provider.finalize().unwrap_err().is(Rv::CRYPTOKI_NOT_INITIALIZED));
    }

    #[test]
    fn should_check_pin_and_share_login() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        provider.initialize().unwrap();
        let first = provider.open_session(0).unwrap();
        assert!(provider.login(first, "4321").unwrap_err().is(Rv::PIN_INCORRECT));
        provider.login(first, "1234").unwrap();

        let second = provider.open_session(0).unwrap();
        assert!(provider.login(second, "1234").unwrap_err().is(Rv::USER_ALREADY_LOGGED_IN));

        provider.close_session(first).unwrap();
        provider.close_session(second).unwrap();

        // The last session closing ends the login.
        let third = provider.open_session(0).unwrap();
        provider.login(third, "1234").unwrap();
    }

    #[test]
    fn should_pad_token_labels() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        provider.initialize().unwrap();
        let label = provider.token_label(0).unwrap();
        assert_eq!(label.len(), TOKEN_LABEL_LENGTH);
        assert!(label.starts_with(b"Test    "));
        assert!(provider.token_label(1).unwrap_err().is(Rv::SLOT_ID_INVALID));
    }

    #[test]
    fn should_hide_private_objects_when_logged_out() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        let session = logged_in(&provider);
        let (public, private) = ec_templates(oid::P256);
        provider
            .generate_key_pair(session, Mechanism::EcKeyPairGen, &public, &private)
            .unwrap();

        let template = [Attribute::Id(vec![1, 2, 3])];
        assert_eq!(provider.find_objects(session, &template).unwrap().len(), 2);
        provider.logout(session).unwrap();
        assert_eq!(provider.find_objects(session, &template).unwrap().len(), 1);
    }

    #[test]
    fn should_sign_with_generated_rsa_key() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        let session = logged_in(&provider);
        let public = [Attribute::Token(true), Attribute::ModulusBits(1024)];
        let private = [Attribute::Token(true)];
        let (pub_handle, priv_handle) = provider
            .generate_key_pair(session, Mechanism::RsaPkcsKeyPairGen, &public, &private)
            .unwrap();

        let attrs = provider
            .get_attributes(session, pub_handle, &[AttributeType::Modulus, AttributeType::PublicExponent])
            .unwrap();
        let n = BigNum::from_slice(find_bytes(&attrs, AttributeType::Modulus).unwrap()).unwrap();
        let e = BigNum::from_slice(find_bytes(&attrs, AttributeType::PublicExponent).unwrap()).unwrap();
        let rsa = Rsa::from_public_components(n, e).unwrap();

        let sig = provider.sign(session, Mechanism::RsaPkcs, priv_handle, b"digest info").unwrap();
        assert_eq!(sig.len(), 128);
        let mut out = vec![0u8; 128];
        let len = rsa.public_decrypt(&sig, &mut out, Padding::PKCS1).unwrap();
        assert_eq!(&out[..len], b"digest info");

        assert!(
            provider
                .sign(session, Mechanism::Ecdsa, priv_handle, b"x")
                .unwrap_err()
                .is(Rv::KEY_TYPE_INCONSISTENT)
        );
    }

    #[test]
    fn should_drop_session_objects_with_session() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        let session = logged_in(&provider);
        let other = provider.open_session(0).unwrap();
        let params = provider
            .generate_key(other, Mechanism::DsaParameterGen, &[Attribute::PrimeBits(1024)])
            .unwrap();
        assert!(provider.get_attributes(session, params, &[AttributeType::Prime]).is_ok());
        provider.close_session(other).unwrap();
        assert!(
            provider
                .get_attributes(session, params, &[AttributeType::Prime])
                .unwrap_err()
                .is(Rv::OBJECT_HANDLE_INVALID)
        );
    }

    #[test]
    fn should_close_sessions_of_removed_token() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        let session = logged_in(&provider);
        assert!(provider.set_token_present("Test", false));
        assert!(provider.session_info(session).unwrap_err().is(Rv::SESSION_HANDLE_INVALID));
        assert!(provider.slots_with_token().unwrap().is_empty());
        assert!(provider.open_session(0).unwrap_err().is(Rv::TOKEN_NOT_PRESENT));
        assert!(!provider.set_token_present("Missing", true));
    }

    #[test]
    fn should_not_support_gost() {
        let provider = BuiltinProvider::new().with_token("Test", "1234");
        let session = logged_in(&provider);
        let err = provider
            .generate_key_pair(session, Mechanism::GostR3410KeyPairGen, &[], &[])
            .unwrap_err();
        assert!(err.is(Rv::MECHANISM_INVALID));
        let (public, private) = ec_templates(&[0x06, 0x01, 0x00]);
        let err = provider
            .generate_key_pair(session, Mechanism::EcKeyPairGen, &public, &private)
            .unwrap_err();
        assert!(err.is(Rv::CURVE_NOT_SUPPORTED));
    }

    #[test]
    fn should_encode_long_octet_strings() {
        assert_eq!(der_octet_string(&[1, 2]), vec![4, 2, 1, 2]);
        assert_eq!(&der_octet_string(&[0; 200])[..3], &[4, 0x81, 200]);
        assert_eq!(&der_octet_string(&[0; 300])[..4], &[4, 0x82, 1, 44]);
    }
}
