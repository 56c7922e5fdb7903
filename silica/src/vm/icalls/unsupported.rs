use crate::context::Context;
use crate::vm::icalls::{not_implemented_invoker, IcallEntry};

/// COM/WinRT interop and the locale-data backends stay mapped but
/// unimplemented, so programs probing for them fail with the managed
/// NotImplementedException rather than a missing-method fault.
const UNSUPPORTED_SIGNATURES: &[&str] = &[
	"System.__ComObject::CreateIUnknown()",
	"System.__ComObject::ReleaseInterfaces()",
	"System.Runtime.InteropServices.Marshal::AddRef(intptr)",
	"System.Runtime.InteropServices.Marshal::Release(intptr)",
	"System.Runtime.InteropServices.Marshal::QueryInterface(intptr,System.Guid&,intptr&)",
	"System.Runtime.InteropServices.Marshal::GetIUnknownForObjectInternal(object)",
	"System.Runtime.InteropServices.Marshal::GetIDispatchForObjectInternal(object)",
	"System.Runtime.InteropServices.Marshal::GetCCW(object,System.Type)",
	"System.Runtime.InteropServices.Marshal::GetObjectForCCW(intptr)",
	"System.Runtime.InteropServices.Marshal::IsComObject(object)",
	"System.Runtime.InteropServices.GCHandle::GetTarget(intptr)",
	"System.Runtime.InteropServices.GCHandle::GetTargetHandle(object,intptr,System.Runtime.InteropServices.GCHandleType)",
	"System.Runtime.InteropServices.GCHandle::FreeHandle(intptr)",
	"System.Runtime.InteropServices.WindowsRuntime.UnsafeNativeMethods::GetRestrictedErrorInfo()",
	"System.Runtime.InteropServices.WindowsRuntime.UnsafeNativeMethods::RoOriginateLanguageException(int,string,intptr)",
	"System.Runtime.InteropServices.WindowsRuntime.UnsafeNativeMethods::RoReportUnhandledError(System.Runtime.InteropServices.WindowsRuntime.IRestrictedErrorInfo)",
	"System.Globalization.CultureInfo::construct_internal_locale_from_lcid(int)",
	"System.Globalization.CultureInfo::construct_internal_locale_from_name(string)",
	"System.Globalization.CultureInfo::internal_get_cultures(bool,bool,bool)",
	"System.Globalization.CultureData::fill_culture_data(int)",
	"System.Globalization.CultureData::fill_number_data(System.Globalization.NumberFormatInfo,int)",
	"System.Globalization.CalendarData::fill_calendar_data(string,int)",
	"System.Globalization.CompareInfo::internal_compare(string,int,int,string,int,int,System.Globalization.CompareOptions)",
	"System.Globalization.CompareInfo::internal_index(string,int,int,string,System.Globalization.CompareOptions,bool)",
	"System.Globalization.RegionInfo::construct_internal_region_from_name(string)",
	"System.Security.Cryptography.RNGCryptoServiceProvider::RngInitialize(byte[])",
	"System.Security.Cryptography.RNGCryptoServiceProvider::RngGetBytes(intptr,byte[])",
	"System.Security.Cryptography.RNGCryptoServiceProvider::RngClose(intptr)",
	"System.Security.SecurityManager::get_SecurityEnabled()",
	"System.Security.SecurityManager::GetLinkDemandSecurity(System.Reflection.MethodBase,System.Security.RuntimeDeclSecurityActions&,System.Security.RuntimeDeclSecurityActions&)",
	"System.Threading.Thread::StartInternal(System.Security.Principal.IPrincipal,System.Threading.StackCrawlMark&)",
	"System.Threading.Thread::SleepInternal(int)",
	"System.Threading.Thread::JoinInternal(int)",
	"System.Threading.InternalThread::Thread_free_internal()",
	"System.Threading.Timer::SetTimeout(long,long)",
];

pub(crate) fn install<'l>(ctx: &'l Context<'l>) {
	for signature in UNSUPPORTED_SIGNATURES {
		ctx.register_icall(signature, IcallEntry::new(not_implemented_invoker));
	}
}
