//! A PKCS#11 library loaded at run time.
//!
//! The library is driven through its function list, as described by the
//! `cryptoki-sys` bindings. Session and object handles of the library are
//! handed out unchanged as plain numbers.
//!
//! Templates and mechanisms are built from raw `CKA_`, `CKK_` and `CKM_`
//! values, which covers DSA, GOST and device side MD5 next to RSA, ECDSA
//! and EdDSA.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex};

use cryptoki_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_C_INITIALIZE_ARGS, CK_FALSE, CK_FUNCTION_LIST, CK_KEY_TYPE,
    CK_MECHANISM, CK_MECHANISM_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SESSION_INFO,
    CK_SLOT_ID, CK_TOKEN_INFO, CK_TRUE, CK_ULONG, CK_UNAVAILABLE_INFORMATION,
};
use cryptoki_sys::{
    CKA_BASE, CKA_CLASS, CKA_DECRYPT, CKA_EC_PARAMS, CKA_EC_POINT, CKA_ENCRYPT, CKA_EXTRACTABLE, CKA_GOSTR3410_PARAMS,
    CKA_GOSTR3411_PARAMS, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_MODULUS, CKA_MODULUS_BITS, CKA_PRIME, CKA_PRIME_BITS,
    CKA_PRIVATE, CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SIGN, CKA_SUBPRIME, CKA_TOKEN, CKA_UNWRAP, CKA_VALUE,
    CKA_VERIFY, CKA_WRAP, CKF_OS_LOCKING_OK, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKK_DSA, CKK_EC, CKK_EC_EDWARDS,
    CKK_GOSTR3410, CKK_RSA, CKM_DSA, CKM_DSA_KEY_PAIR_GEN, CKM_DSA_PARAMETER_GEN, CKM_EC_EDWARDS_KEY_PAIR_GEN,
    CKM_EC_KEY_PAIR_GEN, CKM_ECDSA, CKM_EDDSA, CKM_GOSTR3410, CKM_GOSTR3410_KEY_PAIR_GEN, CKM_GOSTR3411, CKM_MD5,
    CKM_RSA_PKCS, CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_SHA_1, CKM_SHA256, CKM_SHA384, CKM_SHA512, CKO_DOMAIN_PARAMETERS,
    CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID, CKR_OK,
    CKU_USER,
};
use log::{debug, error, trace};

use crate::error::{DeviceError, HsmError, Rv};

use super::{
    Attribute, AttributeType, KeyType, Mechanism, ObjectClass, ObjectHandle, SessionHandle, SessionInfo, SlotId,
};

/// How many handles to ask for per `C_FindObjects` call.
const FIND_BATCH: usize = 32;


//------------ Pkcs11Provider ------------------------------------------------

pub struct Pkcs11Provider {
    lib_path: PathBuf,

    /// The library, `None` once finalized.
    library: Mutex<Option<Arc<Library>>>,
}

/// A loaded library and its function list.
struct Library {
    /// Keeps the shared object mapped for as long as `functions` is used.
    _module: cryptoki_sys::Pkcs11,
    functions: CK_FUNCTION_LIST,
}

impl Pkcs11Provider {
    /// Loads the library at the given path.
    pub fn load(lib_path: &Path) -> Result<Self, HsmError> {
        debug!("Loading PKCS#11 library '{}'", lib_path.display());
        let library = Library::load(lib_path).map_err(|reason| {
            error!("Failed to load PKCS#11 library '{}': {}", lib_path.display(), reason);
            HsmError::ModuleNotFound {
                path: lib_path.to_path_buf(),
                reason,
            }
        })?;
        Ok(Pkcs11Provider {
            lib_path: lib_path.to_path_buf(),
            library: Mutex::new(Some(Arc::new(library))),
        })
    }

    pub fn name(&self) -> String {
        self.lib_path.display().to_string()
    }

    fn library(&self, function: &'static str) -> Result<Arc<Library>, DeviceError> {
        self.library
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DeviceError::new(function, Rv::CRYPTOKI_NOT_INITIALIZED))
    }
}

impl Drop for Pkcs11Provider {
    fn drop(&mut self) {
        // Unloading a library that was never finalized pulls the code out
        // from under whoever else initialized it. Keep it mapped instead.
        if let Some(library) = self.library.lock().unwrap().take() {
            std::mem::forget(library);
        }
    }
}

impl std::fmt::Debug for Pkcs11Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pkcs11Provider").field("lib_path", &self.lib_path).finish()
    }
}

/// # Provider calls
impl Pkcs11Provider {
    pub fn initialize(&self) -> Result<(), DeviceError> {
        const FUNCTION: &str = "C_Initialize";
        trace!("[{}] C_Initialize()", self.name());
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_Initialize.ok_or_else(|| missing(FUNCTION))?;
        let mut args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        check(FUNCTION, unsafe { func(&mut args as *mut CK_C_INITIALIZE_ARGS as *mut c_void) })
    }

    /// Finalizes and unloads the library.
    ///
    /// The provider cannot be used afterwards.
    pub fn finalize(&self) -> Result<(), DeviceError> {
        const FUNCTION: &str = "C_Finalize";
        trace!("[{}] C_Finalize()", self.name());
        let library = self
            .library
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DeviceError::new(FUNCTION, Rv::CRYPTOKI_NOT_INITIALIZED))?;
        let func = library.functions.C_Finalize.ok_or_else(|| missing(FUNCTION))?;
        check(FUNCTION, unsafe { func(ptr::null_mut()) })
    }

    pub fn slots_with_token(&self) -> Result<Vec<SlotId>, DeviceError> {
        const FUNCTION: &str = "C_GetSlotList";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GetSlotList.ok_or_else(|| missing(FUNCTION))?;
        let mut count: CK_ULONG = 0;
        check(FUNCTION, unsafe { func(CK_TRUE, ptr::null_mut(), &mut count) })?;
        let mut slots: Vec<CK_SLOT_ID> = vec![0; to_usize(count)];
        check(FUNCTION, unsafe { func(CK_TRUE, slots.as_mut_ptr(), &mut count) })?;
        slots.truncate(to_usize(count));
        trace!("[{}] C_GetSlotList(): {:?}", self.name(), slots);
        Ok(slots.into_iter().map(u64::from).collect())
    }

    pub fn token_label(&self, slot: SlotId) -> Result<Vec<u8>, DeviceError> {
        const FUNCTION: &str = "C_GetTokenInfo";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GetTokenInfo.ok_or_else(|| missing(FUNCTION))?;
        let slot = native(FUNCTION, slot, Rv::SLOT_ID_INVALID)?;
        let mut info = CK_TOKEN_INFO::default();
        check(FUNCTION, unsafe { func(slot, &mut info) })?;
        Ok(info.label.to_vec())
    }

    pub fn open_session(&self, slot: SlotId) -> Result<SessionHandle, DeviceError> {
        const FUNCTION: &str = "C_OpenSession";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_OpenSession.ok_or_else(|| missing(FUNCTION))?;
        let ck_slot = native(FUNCTION, slot, Rv::SLOT_ID_INVALID)?;
        let mut handle: CK_SESSION_HANDLE = 0;
        check(FUNCTION, unsafe {
            func(
                ck_slot,
                CKF_SERIAL_SESSION | CKF_RW_SESSION,
                ptr::null_mut(),
                None,
                &mut handle,
            )
        })?;
        trace!("[{}] C_OpenSession(slot {}): session {}", self.name(), slot, handle);
        Ok(SessionHandle::new(u64::from(handle)))
    }

    pub fn close_session(&self, session: SessionHandle) -> Result<(), DeviceError> {
        const FUNCTION: &str = "C_CloseSession";
        trace!("[{}] C_CloseSession({})", self.name(), session.value());
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_CloseSession.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        check(FUNCTION, unsafe { func(session) })
    }

    pub fn session_info(&self, session: SessionHandle) -> Result<SessionInfo, DeviceError> {
        const FUNCTION: &str = "C_GetSessionInfo";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GetSessionInfo.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let mut info = CK_SESSION_INFO::default();
        check(FUNCTION, unsafe { func(session, &mut info) })?;
        Ok(SessionInfo {
            slot: u64::from(info.slotID),
        })
    }

    pub fn login(&self, session: SessionHandle, pin: &str) -> Result<(), DeviceError> {
        const FUNCTION: &str = "C_Login";
        trace!("[{}] C_Login({})", self.name(), session.value());
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_Login.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let mut pin = pin.as_bytes().to_vec();
        let len = ulong(FUNCTION, pin.len())?;
        check(FUNCTION, unsafe { func(session, CKU_USER, pin.as_mut_ptr(), len) })
    }

    pub fn logout(&self, session: SessionHandle) -> Result<(), DeviceError> {
        const FUNCTION: &str = "C_Logout";
        trace!("[{}] C_Logout({})", self.name(), session.value());
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_Logout.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        check(FUNCTION, unsafe { func(session) })
    }

    pub fn find_objects(&self, session: SessionHandle, template: &[Attribute]) -> Result<Vec<ObjectHandle>, DeviceError> {
        const FUNCTION: &str = "C_FindObjects";
        let library = self.library(FUNCTION)?;
        let init = library.functions.C_FindObjectsInit.ok_or_else(|| missing("C_FindObjectsInit"))?;
        let find = library.functions.C_FindObjects.ok_or_else(|| missing(FUNCTION))?;
        let finish = library.functions.C_FindObjectsFinal.ok_or_else(|| missing("C_FindObjectsFinal"))?;
        let session = session_handle(FUNCTION, session)?;

        let mut template = Template::new(template);
        let (ptr, len) = template.as_raw("C_FindObjectsInit")?;
        check("C_FindObjectsInit", unsafe { init(session, ptr, len) })?;

        let mut found = Vec::new();
        let mut batch: [CK_OBJECT_HANDLE; FIND_BATCH] = [0; FIND_BATCH];
        let res = loop {
            let mut count: CK_ULONG = 0;
            let rv = unsafe { find(session, batch.as_mut_ptr(), FIND_BATCH as CK_ULONG, &mut count) };
            if let Err(err) = check(FUNCTION, rv) {
                break Err(err);
            }
            if count == 0 {
                break Ok(());
            }
            found.extend(batch[..to_usize(count)].iter().map(|obj| ObjectHandle::new(u64::from(*obj))));
        };
        let finished = check("C_FindObjectsFinal", unsafe { finish(session) });
        res?;
        finished?;
        trace!("[{}] C_FindObjects(): {} objects", self.name(), found.len());
        Ok(found)
    }

    /// Returns those of the requested attributes the object has.
    ///
    /// Attributes the object does not have or will not reveal are left
    /// out rather than failing the call.
    pub fn get_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> Result<Vec<Attribute>, DeviceError> {
        const FUNCTION: &str = "C_GetAttributeValue";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GetAttributeValue.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let object = object_handle(FUNCTION, object)?;

        let mut res = Vec::with_capacity(types.len());
        for attr_type in types {
            let mut attr = CK_ATTRIBUTE {
                type_: attribute_type(*attr_type),
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            };
            let rv = unsafe { func(session, object, &mut attr, 1) };
            if rv == CKR_ATTRIBUTE_TYPE_INVALID || rv == CKR_ATTRIBUTE_SENSITIVE {
                continue;
            }
            check(FUNCTION, rv)?;
            if attr.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                continue;
            }
            let mut value = vec![0u8; to_usize(attr.ulValueLen)];
            attr.pValue = value.as_mut_ptr() as *mut c_void;
            check(FUNCTION, unsafe { func(session, object, &mut attr, 1) })?;
            value.truncate(to_usize(attr.ulValueLen));
            if let Some(attr) = decode_attribute(*attr_type, value) {
                res.push(attr);
            }
        }
        Ok(res)
    }

    pub fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), DeviceError> {
        const FUNCTION: &str = "C_GenerateKeyPair";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GenerateKeyPair.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let mut mechanism = ck_mechanism(mechanism);
        let mut public_template = Template::new(public_template);
        let mut private_template = Template::new(private_template);
        let (public_ptr, public_len) = public_template.as_raw(FUNCTION)?;
        let (private_ptr, private_len) = private_template.as_raw(FUNCTION)?;
        let mut public: CK_OBJECT_HANDLE = 0;
        let mut private: CK_OBJECT_HANDLE = 0;
        check(FUNCTION, unsafe {
            func(
                session,
                &mut mechanism,
                public_ptr,
                public_len,
                private_ptr,
                private_len,
                &mut public,
                &mut private,
            )
        })?;
        Ok((ObjectHandle::new(u64::from(public)), ObjectHandle::new(u64::from(private))))
    }

    pub fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        template: &[Attribute],
    ) -> Result<ObjectHandle, DeviceError> {
        const FUNCTION: &str = "C_GenerateKey";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GenerateKey.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let mut mechanism = ck_mechanism(mechanism);
        let mut template = Template::new(template);
        let (ptr, len) = template.as_raw(FUNCTION)?;
        let mut key: CK_OBJECT_HANDLE = 0;
        check(FUNCTION, unsafe { func(session, &mut mechanism, ptr, len, &mut key) })?;
        Ok(ObjectHandle::new(u64::from(key)))
    }

    pub fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> Result<(), DeviceError> {
        const FUNCTION: &str = "C_DestroyObject";
        trace!("[{}] C_DestroyObject({})", self.name(), object);
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_DestroyObject.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let object = object_handle(FUNCTION, object)?;
        check(FUNCTION, unsafe { func(session, object) })
    }

    pub fn sign(
        &self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        const FUNCTION: &str = "C_Sign";
        let library = self.library(FUNCTION)?;
        let init = library.functions.C_SignInit.ok_or_else(|| missing("C_SignInit"))?;
        let func = library.functions.C_Sign.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let key = object_handle(FUNCTION, key)?;
        let mut mechanism = ck_mechanism(mechanism);
        check("C_SignInit", unsafe { init(session, &mut mechanism, key) })?;

        let mut data = data.to_vec();
        let data_len = ulong(FUNCTION, data.len())?;
        let mut len: CK_ULONG = 0;
        check(FUNCTION, unsafe {
            func(session, data.as_mut_ptr(), data_len, ptr::null_mut(), &mut len)
        })?;
        let mut signature = vec![0u8; to_usize(len)];
        check(FUNCTION, unsafe {
            func(session, data.as_mut_ptr(), data_len, signature.as_mut_ptr(), &mut len)
        })?;
        signature.truncate(to_usize(len));
        Ok(signature)
    }

    pub fn digest(&self, session: SessionHandle, mechanism: Mechanism, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        const FUNCTION: &str = "C_Digest";
        let library = self.library(FUNCTION)?;
        let init = library.functions.C_DigestInit.ok_or_else(|| missing("C_DigestInit"))?;
        let func = library.functions.C_Digest.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let mut mechanism = ck_mechanism(mechanism);
        check("C_DigestInit", unsafe { init(session, &mut mechanism) })?;

        let mut data = data.to_vec();
        let data_len = ulong(FUNCTION, data.len())?;
        let mut len: CK_ULONG = 0;
        check(FUNCTION, unsafe {
            func(session, data.as_mut_ptr(), data_len, ptr::null_mut(), &mut len)
        })?;
        let mut digest = vec![0u8; to_usize(len)];
        check(FUNCTION, unsafe {
            func(session, data.as_mut_ptr(), data_len, digest.as_mut_ptr(), &mut len)
        })?;
        digest.truncate(to_usize(len));
        Ok(digest)
    }

    pub fn generate_random(&self, session: SessionHandle, len: usize) -> Result<Vec<u8>, DeviceError> {
        const FUNCTION: &str = "C_GenerateRandom";
        let library = self.library(FUNCTION)?;
        let func = library.functions.C_GenerateRandom.ok_or_else(|| missing(FUNCTION))?;
        let session = session_handle(FUNCTION, session)?;
        let ck_len = ulong(FUNCTION, len)?;
        let mut res = vec![0u8; len];
        check(FUNCTION, unsafe { func(session, res.as_mut_ptr(), ck_len) })?;
        Ok(res)
    }
}


//------------ Library -------------------------------------------------------

impl Library {
    fn load(lib_path: &Path) -> Result<Self, String> {
        let module = unsafe { cryptoki_sys::Pkcs11::new(lib_path) }.map_err(|err| err.to_string())?;
        let get_list = module
            .C_GetFunctionList
            .as_ref()
            .map_err(|err| format!("no C_GetFunctionList: {}", err))?;
        let mut list: *mut CK_FUNCTION_LIST = ptr::null_mut();
        let rv = unsafe { get_list(&mut list) };
        if rv != CKR_OK {
            return Err(format!("C_GetFunctionList failed with {}", Rv(u64::from(rv))));
        }
        if list.is_null() {
            return Err("C_GetFunctionList returned no function list".into());
        }
        let functions = unsafe { *list };
        Ok(Library {
            _module: module,
            functions,
        })
    }
}


//------------ Template ------------------------------------------------------

/// Attributes encoded for passing to the library.
///
/// The values are owned here so the pointers in `attrs` stay valid for as
/// long as the template lives.
struct Template {
    values: Vec<(CK_ATTRIBUTE_TYPE, Vec<u8>)>,
    attrs: Vec<CK_ATTRIBUTE>,
}

impl Template {
    fn new(attrs: &[Attribute]) -> Self {
        Template {
            values: attrs.iter().map(encode_attribute).collect(),
            attrs: Vec::new(),
        }
    }

    fn as_raw(&mut self, function: &'static str) -> Result<(*mut CK_ATTRIBUTE, CK_ULONG), DeviceError> {
        let mut attrs = Vec::with_capacity(self.values.len());
        for (attr_type, value) in self.values.iter_mut() {
            attrs.push(CK_ATTRIBUTE {
                type_: *attr_type,
                pValue: value.as_mut_ptr() as *mut c_void,
                ulValueLen: ulong(function, value.len())?,
            });
        }
        self.attrs = attrs;
        Ok((self.attrs.as_mut_ptr(), ulong(function, self.attrs.len())?))
    }
}


//------------ Conversions ---------------------------------------------------

fn check(function: &'static str, rv: CK_RV) -> Result<(), DeviceError> {
    if rv == CKR_OK {
        Ok(())
    } else {
        Err(DeviceError::new(function, Rv(u64::from(rv))))
    }
}

fn missing(function: &'static str) -> DeviceError {
    DeviceError::with_detail(function, Rv::GENERAL_ERROR, "function missing from library")
}

fn ulong(function: &'static str, value: usize) -> Result<CK_ULONG, DeviceError> {
    CK_ULONG::try_from(value).map_err(|_| DeviceError::new(function, Rv::DATA_LEN_RANGE))
}

fn to_usize(value: CK_ULONG) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn native(function: &'static str, value: u64, rv: Rv) -> Result<CK_ULONG, DeviceError> {
    CK_ULONG::try_from(value).map_err(|_| DeviceError::new(function, rv))
}

fn session_handle(function: &'static str, session: SessionHandle) -> Result<CK_SESSION_HANDLE, DeviceError> {
    native(function, session.value(), Rv::SESSION_HANDLE_INVALID)
}

fn object_handle(function: &'static str, object: ObjectHandle) -> Result<CK_OBJECT_HANDLE, DeviceError> {
    native(function, object.value(), Rv::OBJECT_HANDLE_INVALID)
}

fn mechanism_type(mechanism: Mechanism) -> CK_MECHANISM_TYPE {
    match mechanism {
        Mechanism::RsaPkcsKeyPairGen => CKM_RSA_PKCS_KEY_PAIR_GEN,
        Mechanism::DsaParameterGen => CKM_DSA_PARAMETER_GEN,
        Mechanism::DsaKeyPairGen => CKM_DSA_KEY_PAIR_GEN,
        Mechanism::GostR3410KeyPairGen => CKM_GOSTR3410_KEY_PAIR_GEN,
        Mechanism::EcKeyPairGen => CKM_EC_KEY_PAIR_GEN,
        Mechanism::EcEdwardsKeyPairGen => CKM_EC_EDWARDS_KEY_PAIR_GEN,
        Mechanism::RsaPkcs => CKM_RSA_PKCS,
        Mechanism::Dsa => CKM_DSA,
        Mechanism::GostR3410 => CKM_GOSTR3410,
        Mechanism::Ecdsa => CKM_ECDSA,
        Mechanism::Eddsa => CKM_EDDSA,
        Mechanism::Md5 => CKM_MD5,
        Mechanism::Sha1 => CKM_SHA_1,
        Mechanism::Sha256 => CKM_SHA256,
        Mechanism::Sha384 => CKM_SHA384,
        Mechanism::Sha512 => CKM_SHA512,
        Mechanism::GostR3411 => CKM_GOSTR3411,
    }
}

/// None of our mechanisms take parameters. Pure EdDSA is the default.
fn ck_mechanism(mechanism: Mechanism) -> CK_MECHANISM {
    CK_MECHANISM {
        mechanism: mechanism_type(mechanism),
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    }
}

fn attribute_type(attr_type: AttributeType) -> CK_ATTRIBUTE_TYPE {
    match attr_type {
        AttributeType::Class => CKA_CLASS,
        AttributeType::KeyType => CKA_KEY_TYPE,
        AttributeType::Id => CKA_ID,
        AttributeType::Label => CKA_LABEL,
        AttributeType::Token => CKA_TOKEN,
        AttributeType::Private => CKA_PRIVATE,
        AttributeType::Sensitive => CKA_SENSITIVE,
        AttributeType::Extractable => CKA_EXTRACTABLE,
        AttributeType::Sign => CKA_SIGN,
        AttributeType::Verify => CKA_VERIFY,
        AttributeType::Encrypt => CKA_ENCRYPT,
        AttributeType::Decrypt => CKA_DECRYPT,
        AttributeType::Wrap => CKA_WRAP,
        AttributeType::Unwrap => CKA_UNWRAP,
        AttributeType::Modulus => CKA_MODULUS,
        AttributeType::ModulusBits => CKA_MODULUS_BITS,
        AttributeType::PublicExponent => CKA_PUBLIC_EXPONENT,
        AttributeType::Prime => CKA_PRIME,
        AttributeType::SubPrime => CKA_SUBPRIME,
        AttributeType::Base => CKA_BASE,
        AttributeType::PrimeBits => CKA_PRIME_BITS,
        AttributeType::Value => CKA_VALUE,
        AttributeType::EcParams => CKA_EC_PARAMS,
        AttributeType::EcPoint => CKA_EC_POINT,
        AttributeType::GostR3410Params => CKA_GOSTR3410_PARAMS,
        AttributeType::GostR3411Params => CKA_GOSTR3411_PARAMS,
    }
}

fn object_class(class: ObjectClass) -> CK_OBJECT_CLASS {
    match class {
        ObjectClass::PublicKey => CKO_PUBLIC_KEY,
        ObjectClass::PrivateKey => CKO_PRIVATE_KEY,
        ObjectClass::SecretKey => CKO_SECRET_KEY,
        ObjectClass::DomainParameters => CKO_DOMAIN_PARAMETERS,
    }
}

fn key_type(key_type: KeyType) -> CK_KEY_TYPE {
    match key_type {
        KeyType::Rsa => CKK_RSA,
        KeyType::Dsa => CKK_DSA,
        KeyType::Ec => CKK_EC,
        KeyType::EcEdwards => CKK_EC_EDWARDS,
        KeyType::Gost => CKK_GOSTR3410,
    }
}

fn ulong_bytes(value: CK_ULONG) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

fn bool_bytes(value: bool) -> Vec<u8> {
    vec![if value { CK_TRUE } else { CK_FALSE }]
}

fn encode_attribute(attr: &Attribute) -> (CK_ATTRIBUTE_TYPE, Vec<u8>) {
    let attr_type = attribute_type(attr.attribute_type());
    let value = match attr {
        Attribute::Class(class) => ulong_bytes(object_class(*class)),
        Attribute::KeyType(kt) => ulong_bytes(key_type(*kt)),
        Attribute::ModulusBits(bits) | Attribute::PrimeBits(bits) => {
            ulong_bytes(CK_ULONG::try_from(*bits).unwrap_or(CK_ULONG::MAX))
        }
        Attribute::Token(b)
        | Attribute::Private(b)
        | Attribute::Sensitive(b)
        | Attribute::Extractable(b)
        | Attribute::Sign(b)
        | Attribute::Verify(b)
        | Attribute::Encrypt(b)
        | Attribute::Decrypt(b)
        | Attribute::Wrap(b)
        | Attribute::Unwrap(b) => bool_bytes(*b),
        Attribute::Id(v)
        | Attribute::Label(v)
        | Attribute::Modulus(v)
        | Attribute::PublicExponent(v)
        | Attribute::Prime(v)
        | Attribute::SubPrime(v)
        | Attribute::Base(v)
        | Attribute::Value(v)
        | Attribute::EcParams(v)
        | Attribute::EcPoint(v)
        | Attribute::GostR3410Params(v)
        | Attribute::GostR3411Params(v) => v.clone(),
    };
    (attr_type, value)
}

fn decode_ulong(value: &[u8]) -> Option<CK_ULONG> {
    let bytes = value.try_into().ok()?;
    Some(CK_ULONG::from_ne_bytes(bytes))
}

fn decode_attribute(attr_type: AttributeType, value: Vec<u8>) -> Option<Attribute> {
    let flag = value.first().map(|b| *b != CK_FALSE);
    let res = match attr_type {
        AttributeType::Class => Attribute::Class(match decode_ulong(&value)? {
            CKO_PUBLIC_KEY => ObjectClass::PublicKey,
            CKO_PRIVATE_KEY => ObjectClass::PrivateKey,
            CKO_SECRET_KEY => ObjectClass::SecretKey,
            CKO_DOMAIN_PARAMETERS => ObjectClass::DomainParameters,
            _ => return None,
        }),
        AttributeType::KeyType => Attribute::KeyType(match decode_ulong(&value)? {
            CKK_RSA => KeyType::Rsa,
            CKK_DSA => KeyType::Dsa,
            CKK_EC => KeyType::Ec,
            CKK_EC_EDWARDS => KeyType::EcEdwards,
            CKK_GOSTR3410 => KeyType::Gost,
            _ => return None,
        }),
        AttributeType::ModulusBits => Attribute::ModulusBits(u64::from(decode_ulong(&value)?)),
        AttributeType::PrimeBits => Attribute::PrimeBits(u64::from(decode_ulong(&value)?)),
        AttributeType::Token => Attribute::Token(flag?),
        AttributeType::Private => Attribute::Private(flag?),
        AttributeType::Sensitive => Attribute::Sensitive(flag?),
        AttributeType::Extractable => Attribute::Extractable(flag?),
        AttributeType::Sign => Attribute::Sign(flag?),
        AttributeType::Verify => Attribute::Verify(flag?),
        AttributeType::Encrypt => Attribute::Encrypt(flag?),
        AttributeType::Decrypt => Attribute::Decrypt(flag?),
        AttributeType::Wrap => Attribute::Wrap(flag?),
        AttributeType::Unwrap => Attribute::Unwrap(flag?),
        AttributeType::Id => Attribute::Id(value),
        AttributeType::Label => Attribute::Label(value),
        AttributeType::Modulus => Attribute::Modulus(value),
        AttributeType::PublicExponent => Attribute::PublicExponent(value),
        AttributeType::Prime => Attribute::Prime(value),
        AttributeType::SubPrime => Attribute::SubPrime(value),
        AttributeType::Base => Attribute::Base(value),
        AttributeType::Value => Attribute::Value(value),
        AttributeType::EcParams => Attribute::EcParams(value),
        AttributeType::EcPoint => Attribute::EcPoint(value),
        AttributeType::GostR3410Params => Attribute::GostR3410Params(value),
        AttributeType::GostR3411Params => Attribute::GostR3411Params(value),
    };
    Some(res)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_map_dnssec_mechanisms() {
        assert_eq!(mechanism_type(Mechanism::DsaKeyPairGen), 0x10);
        assert_eq!(mechanism_type(Mechanism::Dsa), 0x11);
        assert_eq!(mechanism_type(Mechanism::Md5), 0x210);
        assert_eq!(mechanism_type(Mechanism::GostR3410KeyPairGen), 0x1200);
        assert_eq!(mechanism_type(Mechanism::GostR3410), 0x1201);
        assert_eq!(mechanism_type(Mechanism::GostR3411), 0x1210);
        assert_eq!(mechanism_type(Mechanism::DsaParameterGen), 0x2000);
        assert_eq!(mechanism_type(Mechanism::RsaPkcs), 0x01);

        let mechanism = ck_mechanism(Mechanism::Eddsa);
        assert!(mechanism.pParameter.is_null());
        assert_eq!(mechanism.ulParameterLen, 0);
    }

    #[test]
    fn should_encode_dsa_and_gost_attributes() {
        assert_eq!(
            encode_attribute(&Attribute::SubPrime(vec![1, 2, 3])),
            (0x131, vec![1, 2, 3])
        );
        assert_eq!(encode_attribute(&Attribute::PrimeBits(1024)), (0x133, ulong_bytes(1024)));
        assert_eq!(encode_attribute(&Attribute::GostR3410Params(vec![6])).0, 0x250);
        assert_eq!(encode_attribute(&Attribute::GostR3411Params(vec![6])).0, 0x251);
        assert_eq!(
            encode_attribute(&Attribute::KeyType(KeyType::Gost)),
            (CKA_KEY_TYPE, ulong_bytes(0x30))
        );
        assert_eq!(encode_attribute(&Attribute::Sign(true)), (CKA_SIGN, vec![1]));
    }

    #[test]
    fn should_decode_attribute_values() {
        assert_eq!(
            decode_attribute(AttributeType::KeyType, ulong_bytes(CKK_GOSTR3410)),
            Some(Attribute::KeyType(KeyType::Gost))
        );
        assert_eq!(
            decode_attribute(AttributeType::Class, ulong_bytes(CKO_DOMAIN_PARAMETERS)),
            Some(Attribute::Class(ObjectClass::DomainParameters))
        );
        assert_eq!(
            decode_attribute(AttributeType::SubPrime, vec![9; 20]),
            Some(Attribute::SubPrime(vec![9; 20]))
        );
        assert_eq!(decode_attribute(AttributeType::Sign, vec![0]), Some(Attribute::Sign(false)));
        assert_eq!(decode_attribute(AttributeType::KeyType, vec![1, 2]), None);
        assert_eq!(decode_attribute(AttributeType::KeyType, ulong_bytes(0x8000_0001)), None);
    }

    #[test]
    fn should_keep_template_values_alive() {
        let mut template = Template::new(&[Attribute::Label(b"zone".to_vec()), Attribute::Token(true)]);
        let (ptr, len) = template.as_raw("C_FindObjectsInit").unwrap();
        assert_eq!(len, 2);
        let attrs = unsafe { std::slice::from_raw_parts(ptr, 2) };
        assert_eq!(attrs[0].type_, CKA_LABEL);
        assert_eq!(attrs[0].ulValueLen, 4);
        let label = unsafe { std::slice::from_raw_parts(attrs[0].pValue as *const u8, 4) };
        assert_eq!(label, b"zone");
    }

    #[test]
    fn should_pass_return_values_through() {
        let err = check("C_Login", 0xa0).unwrap_err();
        assert!(err.is(Rv::PIN_INCORRECT));
        assert_eq!(err.function(), "C_Login");
        assert!(check("C_Login", CKR_OK).is_ok());
    }

    #[test]
    fn should_report_missing_library() {
        let err = Pkcs11Provider::load(Path::new("/nonexistent/libnothing.so")).unwrap_err();
        assert!(matches!(err, HsmError::ModuleNotFound { .. }));
    }
}
